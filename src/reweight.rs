//! Estimates for new thermodynamic states, made by reweighting the pooled samples.
//!
//! Every estimate takes `u_new`, the reduced potential energy of each frame of
//! [`Estimator::merged_trajectory`] under the new state, and requires a solved estimator.
//!
//! There are two reweighting paths. The differentiable path ([`Estimator::estimate_weight`] and
//! [`Estimator::estimate_free_energy`]) returns the estimate together with its gradient with
//! respect to `u_new`, so that a caller with $\partial u_\mathrm{new} / \partial \theta$ for some
//! force field parameters $\theta$ can fit those parameters. The numeric path
//! ([`Estimator::estimate_weight_numeric`]) feeds the covariance, variance and effective sample
//! size estimates. Both paths give the same normalized weights; they shift the exponents
//! differently before exponentiating.

use crate::covariance::compute_covariance;
use crate::errors::*;
use crate::estimator::{Estimator, Solved};
use crate::numeric::mean;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::cmp::Ordering;

/// Normalized importance weights of the pooled frames in a new state
#[derive(Debug, Clone, PartialEq)]
pub struct WeightEstimate {
    /// `weight[n]` is the normalized weight of frame `n`; positive, sums to 1
    pub weight: Array1<f64>,
    /// $-\ln \sum_n c_n$ of the unnormalized weights $c_n$
    ///
    /// The exponents are shifted by the minimum of `u_new` and of $f_k - u_{kn}$ before summing,
    /// so this is only a free energy up to that shift. Use [`Estimator::estimate_free_energy`] for
    /// the free energy of a new state.
    pub free_energy: f64,
    argmin: usize,
}

impl WeightEstimate {
    /// Pull a cotangent on the weights back onto `u_new`
    ///
    /// Returns $\partial (v \cdot w) / \partial u_\mathrm{new}$, which is
    /// $w_j (v \cdot w - v_j)$ for frame $j$.
    pub fn pullback(&self, cotangent: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        if cotangent.len() != self.weight.len() {
            return Err(MBarError::ArrayLengthMismatch(
                cotangent.len(),
                self.weight.len(),
            ));
        }
        let v_dot_w = cotangent.dot(&self.weight);
        Ok(&self.weight * &cotangent.mapv(|v| v_dot_w - v))
    }

    /// Gradient of `free_energy` with respect to `u_new`
    ///
    /// Includes the contribution of the shift by the minimum of `u_new`.
    pub fn free_energy_gradient(&self) -> Array1<f64> {
        let mut gradient = self.weight.clone();
        gradient[self.argmin] -= 1.0;
        gradient
    }

    /// Gradient of $v \cdot w$ with respect to parameters $\theta$
    ///
    /// `jacobian[n, p]` is $\partial u_\mathrm{new}[n] / \partial \theta_p$.
    pub fn chain(
        &self,
        cotangent: ArrayView1<'_, f64>,
        jacobian: ArrayView2<'_, f64>,
    ) -> Result<Array1<f64>> {
        chain(self.pullback(cotangent)?.view(), jacobian)
    }
}

/// The free energy of a new state and its gradient
#[derive(Debug, Clone, PartialEq)]
pub struct FreeEnergyEstimate {
    /// Dimensionless free energy of the new state, on the same scale as `f_k`
    pub free_energy: f64,
    /// `gradient[n]` is $\partial f_\mathrm{new} / \partial u_\mathrm{new}[n]$
    ///
    /// These are the normalized weights of the frames in the new state.
    pub gradient: Array1<f64>,
}

impl FreeEnergyEstimate {
    /// Gradient of the free energy with respect to parameters $\theta$
    ///
    /// `jacobian[n, p]` is $\partial u_\mathrm{new}[n] / \partial \theta_p$.
    pub fn chain(&self, jacobian: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        chain(self.gradient.view(), jacobian)
    }
}

fn chain(gradient: ArrayView1<'_, f64>, jacobian: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
    if jacobian.nrows() != gradient.len() {
        return Err(MBarError::ArrayLengthMismatch(
            jacobian.nrows(),
            gradient.len(),
        ));
    }
    Ok(gradient.dot(&jacobian))
}

/// Kish effective sample size $(\sum_n w_n)^2 / \sum_n w_n^2$
///
/// For normalized weights this is $1 / \sum_n w_n^2$, between 1 and the number of frames.
pub fn effective_sample_size(weight: ArrayView1<'_, f64>) -> f64 {
    let sum = weight.sum();
    sum * sum / weight.dot(&weight)
}

/// Stack extra rows under a weight matrix
fn append_rows(w_kn: &Array2<f64>, rows: &[ArrayView1<'_, f64>]) -> Array2<f64> {
    let k = w_kn.nrows();
    Array2::from_shape_fn((k + rows.len(), w_kn.ncols()), |(i, n)| {
        if i < k {
            w_kn[[i, n]]
        } else {
            rows[i - k][n]
        }
    })
}

/// State counts with zeros for appended rows
fn append_counts(n_k: &Array1<usize>, extra: usize) -> Array1<f64> {
    n_k.iter()
        .map(|&n| n as f64)
        .chain(std::iter::repeat(0.0).take(extra))
        .collect()
}

impl<F> Solved<F> {
    /// $f_k - u_{kn}$
    fn du_kn(&self) -> Array2<f64> {
        Array2::from_shape_fn(self.u_kn.dim(), |(k, n)| self.f_k[k] - self.u_kn[[k, n]])
    }

    fn n_k_f64(&self) -> Array1<f64> {
        self.n_k.mapv(|n| n as f64)
    }

    /// $c_n = 1 / \sum_k N_k \exp(f_k - u_{kn} + u_\mathrm{new}[n] - \mathrm{shift})$
    fn accumulator(
        &self,
        du_kn: &Array2<f64>,
        u_new: ArrayView1<'_, f64>,
        shift: f64,
    ) -> Array1<f64> {
        let n_k = self.n_k_f64();
        Array1::from_shape_fn(u_new.len(), |n| {
            let denom = du_kn
                .column(n)
                .iter()
                .zip(n_k.iter())
                .map(|(&du, &count)| (du + u_new[n] - shift).exp() * count)
                .sum::<f64>();
            1.0 / denom
        })
    }
}

impl<F, S> Estimator<F, S> {
    fn check_frames(&self, values: ArrayView1<'_, f64>) -> Result<&Solved<F>> {
        let solved = self.solved()?;
        if values.len() != solved.u_kn.ncols() {
            return Err(MBarError::ArrayLengthMismatch(
                values.len(),
                solved.u_kn.ncols(),
            ));
        }
        Ok(solved)
    }

    /// Normalized weights of the pooled frames in the state with reduced energies `u_new`
    ///
    /// Self-normalized importance sampling, with exponents shifted by the minimum of `u_new` and
    /// the minimum of $f_k - u_{kn}$:
    ///
    /// $$
    /// \begin{aligned}
    ///     \delta_{kn} &= f_k - u_{kn} + u_\mathrm{new}[n] - \min u_\mathrm{new} - \min(f - u) \\\\
    ///     c_n &= 1 / \sum_k N_k e^{\delta_{kn}} \\\\
    ///     w_n &= c_n / \sum_n c_n
    /// \end{aligned}
    /// $$
    ///
    /// The returned estimate can pull gradients on the weights back onto `u_new`.
    pub fn estimate_weight(&self, u_new: ArrayView1<'_, f64>) -> Result<WeightEstimate> {
        let solved = self.check_frames(u_new)?;
        let du_kn = solved.du_kn();

        let (argmin, u_min) = u_new.iter().enumerate().fold(
            (0, std::f64::INFINITY),
            |(i_min, u_min), (i, &u)| if u < u_min { (i, u) } else { (i_min, u_min) },
        );
        let du_min = du_kn.fold(std::f64::INFINITY, |m, &du| m.min(du));

        let c_n = solved.accumulator(&du_kn, u_new, u_min + du_min);
        let c_sum = c_n.sum();

        Ok(WeightEstimate {
            weight: c_n / c_sum,
            free_energy: -c_sum.ln(),
            argmin,
        })
    }

    /// Normalized weights of the pooled frames in the state with reduced energies `u_new`
    ///
    /// The same estimator as [`Estimator::estimate_weight`], but with exponents shifted by the
    /// means of `u_new` and $f_k - u_{kn}$, and no gradients.
    pub fn estimate_weight_numeric(&self, u_new: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        Ok(self.estimate_weight_numeric_with_accumulator(u_new)?.0)
    }

    /// Like [`Estimator::estimate_weight_numeric`], but also return the unnormalized weights
    /// $c_n$ before they are divided by their sum
    pub fn estimate_weight_numeric_with_accumulator(
        &self,
        u_new: ArrayView1<'_, f64>,
    ) -> Result<(Array1<f64>, Array1<f64>)> {
        let solved = self.check_frames(u_new)?;
        let du_kn = solved.du_kn();

        let du_mean = du_kn.sum() / du_kn.len() as f64;
        let c_n = solved.accumulator(&du_kn, u_new, mean(u_new) + du_mean);
        let weight = &c_n / c_n.sum();
        Ok((weight, c_n))
    }

    /// Dimensionless free energy of the state with reduced energies `u_new`, and its gradient
    ///
    /// Every reduction is a log-sum-exp shifted by its maximum:
    ///
    /// $$
    /// \begin{aligned}
    ///     a_{kn} &= f_k - u_{kn} \\\\
    ///     \ln D_n &= \ln \sum_k N_k e^{a_{kn} - \max_k a_{kn}} + \max_k a_{kn} \\\\
    ///     b_n &= -u_\mathrm{new}[n] - \ln D_n \\\\
    ///     f_\mathrm{new} &= -\ln \sum_n e^{b_n - \max b} - \max b
    /// \end{aligned}
    /// $$
    pub fn estimate_free_energy(&self, u_new: ArrayView1<'_, f64>) -> Result<FreeEnergyEstimate> {
        let solved = self.check_frames(u_new)?;
        let a_kn = solved.du_kn();
        let n_k = solved.n_k_f64();

        let log_denominator_n = Array1::from_shape_fn(u_new.len(), |n| {
            let a_n = a_kn.column(n);
            let a_max = a_n.fold(std::f64::NEG_INFINITY, |m, &a| m.max(a));
            let sum = a_n
                .iter()
                .zip(n_k.iter())
                .map(|(&a, &count)| count * (a - a_max).exp())
                .sum::<f64>();
            sum.ln() + a_max
        });

        let a2_n = u_new.mapv(|u| -u) - &log_denominator_n;
        let a2_max = a2_n.fold(std::f64::NEG_INFINITY, |m, &a| m.max(a));
        let free_energy = -a2_n.mapv(|a| (a - a2_max).exp()).sum().ln() - a2_max;
        let gradient = a2_n.mapv(|a| (a + free_energy).exp());

        Ok(FreeEnergyEstimate {
            free_energy,
            gradient,
        })
    }

    /// Asymptotic covariance of the free energies of all states plus the state with reduced
    /// energies `u_new`
    ///
    /// The weights of the new state are appended to the weight matrix as an extra row with no
    /// samples of its own, so the result is $(K+1) \times (K+1)$ with the new state last.
    pub fn compute_covar_mat(&self, u_new: ArrayView1<'_, f64>) -> Result<Array2<f64>> {
        let w_new = self.estimate_weight_numeric(u_new)?;
        let solved = self.solved()?;

        let w_kn = append_rows(&solved.w_kn, &[w_new.view()]);
        let n_k = append_counts(&solved.n_k, 1);
        compute_covariance(w_kn.view(), n_k.view())
    }

    /// Variance of the reweighted expectation of an observable in the state with reduced
    /// energies `u_new`
    ///
    /// `prop[n]` is the value of the observable for frame `n`. The weight matrix is augmented with
    /// the new state's weights $w$ and with $w \cdot A / \langle A \rangle$, and the variance of
    /// $\langle A \rangle$ follows from the covariance of the two appended rows:
    ///
    /// $$
    ///     \mathrm{Var}(\langle A \rangle) = \langle A \rangle^2
    ///         (\Theta_{-2,-2} + \Theta_{-1,-1} - 2 \Theta_{-1,-2})
    /// $$
    ///
    /// An observable whose reweighted mean is exactly zero gives a non-finite variance.
    pub fn compute_variance(
        &self,
        u_new: ArrayView1<'_, f64>,
        prop: ArrayView1<'_, f64>,
    ) -> Result<f64> {
        self.check_frames(prop)?;
        let w_new = self.estimate_weight_numeric(u_new)?;
        let solved = self.solved()?;

        let a_ave = prop.dot(&w_new);
        let w_a = &w_new * &prop.mapv(|a| a / a_ave);

        let w_kn = append_rows(&solved.w_kn, &[w_new.view(), w_a.view()]);
        let n_k = append_counts(&solved.n_k, 2);
        let theta = compute_covariance(w_kn.view(), n_k.view())?;

        let last = theta.nrows() - 1;
        Ok(a_ave
            * a_ave
            * (theta[[last - 1, last - 1]] + theta[[last, last]] - 2.0 * theta[[last, last - 1]]))
    }

    /// Kish effective sample size of the pooled frames in the state with reduced energies `u_new`
    pub fn estimate_effective_sample(&self, u_new: ArrayView1<'_, f64>) -> Result<f64> {
        let w_new = self.estimate_weight_numeric(u_new)?;
        Ok(effective_sample_size(w_new.view()))
    }

    /// Effective sample size, and which states the most heavily weighted frames came from
    ///
    /// Takes the $\lceil n_\mathrm{eff} \rceil + 1$ frames with the largest weights and counts how
    /// many of them were sampled from each state. This is a rough picture of which states dominate
    /// the estimate, not a decomposition of $n_\mathrm{eff}$.
    pub fn estimate_effective_sample_decomposed(
        &self,
        u_new: ArrayView1<'_, f64>,
    ) -> Result<(f64, Array1<usize>)> {
        let w_new = self.estimate_weight_numeric(u_new)?;
        let n_eff = effective_sample_size(w_new.view());
        let n_k = &self.solved()?.n_k;

        let mut order: Vec<usize> = (0..w_new.len()).collect();
        order.sort_by(|&a, &b| w_new[b].partial_cmp(&w_new[a]).unwrap_or(Ordering::Equal));
        let n_top = (n_eff.ceil() as usize + 1).min(order.len());

        let mut bounds = Vec::with_capacity(n_k.len());
        let mut start = 0;
        for &n in n_k.iter() {
            bounds.push(start + n);
            start += n;
        }

        let mut state_effect = Array1::zeros(n_k.len());
        for &frame in &order[..n_top] {
            let k = bounds.iter().position(|&end| frame < end).unwrap_or(0);
            state_effect[k] += 1;
        }
        Ok((n_eff, state_effect))
    }

    /// Compute the effective sample number of each state
    ///
    /// The effective sample number $n_\mathrm{eff}(k)$ is an estimate of how many samples are
    /// contributing to the average at a given state.
    ///
    /// # Returns
    ///
    /// `n_eff[k]` is the estimated number of samples contributing to estimates at each
    /// state k, computed from row `k` of the normalized weight matrix. It lies between 1 (one
    /// frame carries all the weight) and N (uniform weights).
    ///
    /// # Notes
    ///
    /// Using Kish (1965) formula (Kish, Leslie (1965). Survey Sampling. New York: Wiley)
    ///
    /// $$
    ///     n_\mathrm{eff}(k)
    ///         =  \frac{(\sum_{n=1}^N w_{kn})^2}{\sum_{n=1}^N w_{kn}^2}
    /// $$
    pub fn n_eff(&self) -> Result<Array1<f64>> {
        let solved = self.solved()?;
        Ok(solved
            .w_kn
            .outer_iter()
            .map(effective_sample_size)
            .collect())
    }
}
