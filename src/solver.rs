//! Solvers for the self-consistent MBAR equations.
//!
//! A [`Solver`] takes the reduced energy matrix $u_{kn}$ of every frame under every state and the
//! number of frames $N_k$ drawn from each state, and returns the dimensionless free energies
//! $f_k$ that satisfy
//!
//! $$
//!     f_i = -\ln \sum_{n=1}^N \frac{\exp(-u_{in})}{\sum_{k=1}^K N_k \exp(f_k - u_{kn})}
//! $$
//!
//! together with the normalized weight matrix
//! $W_{kn} = \exp(f_k - u_{kn}) / \sum_j N_j \exp(f_j - u_{jn})$.

use crate::errors::*;
use crate::numeric::{fermi, logsumexp};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::str::FromStr;

/// Default iteration limit of [`SelfConsistentSolver`]
pub const DEFAULT_MAXIMUM_ITERATIONS: usize = 10_000;

/// Default relative tolerance of [`SelfConsistentSolver`]
pub const DEFAULT_RELATIVE_TOLERANCE: f64 = 1.0e-12;

/// Define the initial guess for free energies
///
/// `InitialFreeEnergies::BAR` works best when the states are ordered such that adjacent states
/// maximize the overlap between states. Its up to the user to arrange the states in such an order,
/// or at least close to such an order. If you are uncertain what the order of states should be, or
/// if it does not make sense to think of states as adjacent, then choose
/// `InitialFreeEnergies::Zeros`.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialFreeEnergies {
    /// Use the specified free energy values
    Specified(Vec<f64>),
    /// Initialize all free energies to zero
    Zeros,
    /// Use BAR between the pairwise state to initialize the free energies.
    ///
    /// Eventually, should specify a path; for now, it just does it zipping up the states.
    BAR,
}

impl Default for InitialFreeEnergies {
    fn default() -> Self {
        Self::BAR
    }
}

impl From<&[f64]> for InitialFreeEnergies {
    fn from(slice: &[f64]) -> Self {
        Self::Specified(Vec::from(slice))
    }
}

impl FromStr for InitialFreeEnergies {
    type Err = MBarError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BAR" | "bar" => Ok(Self::BAR),
            "zeros" | "Zeros" => Ok(Self::Zeros),
            other => Err(MBarError::BuilderError(format!(
                "unknown initialization strategy {:?}; expected \"BAR\" or \"zeros\"",
                other
            ))),
        }
    }
}

/// Free energies and weights satisfying the self-consistent equations
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// `f_k[k]` is the dimensionless free energy of state `k`, relative to state 0
    pub f_k: Array1<f64>,
    /// `w_kn[k, n]` is the normalized weight of frame `n` in state `k`
    ///
    /// Each row sums to 1, and $\sum_k N_k W_{kn} = 1$ for every frame.
    pub w_kn: Array2<f64>,
    /// `n_k[k]` is the number of frames sampled from state `k`
    pub n_k: Array1<usize>,
}

/// Something that solves the self-consistent MBAR equations
pub trait Solver {
    /// Solve for the free energies of the states whose energies make up the rows of `u_kn`
    ///
    /// `u_kn[k, n]` is the reduced potential energy of frame `n` under state `k`, and the frames
    /// are ordered such that the first `n_k[0]` come from state 0, the next `n_k[1]` from state 1,
    /// and so forth.
    fn solve(
        &self,
        u_kn: ArrayView2<'_, f64>,
        n_k: ArrayView1<'_, usize>,
        initialize: &InitialFreeEnergies,
    ) -> Result<Solution>;
}

/// Check that `n_k` describes the columns of `u_kn`
pub(crate) fn check_counts(u_kn: ArrayView2<'_, f64>, n_k: ArrayView1<'_, usize>) -> Result<()> {
    let k = u_kn.len_of(Axis(0));
    let n_tot = u_kn.len_of(Axis(1));

    if k != n_k.len() {
        return Err(MBarError::ShapeMismatch(format!(
            "n_k's length ({}) must equal the number of states ({})",
            n_k.len(),
            k
        )));
    }
    if n_tot != n_k.sum() {
        return Err(MBarError::ShapeMismatch(format!(
            "n_k.sum() ({}) must equal the total number of samples ({})",
            n_k.sum(),
            n_tot
        )));
    }
    Ok(())
}

/// Native fixed-point solver for the MBAR equations
///
/// Iterates the self-consistent equations in log space until the largest change in any free
/// energy, relative to the largest free energy, drops below `relative_tolerance`.
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct SelfConsistentSolver {
    /// Set to limit the maximum number of iterations performed
    #[builder(default = "DEFAULT_MAXIMUM_ITERATIONS")]
    maximum_iterations: usize,

    /// Set to determine the relative tolerance convergence criteria
    #[builder(default = "DEFAULT_RELATIVE_TOLERANCE")]
    relative_tolerance: f64,
}

impl SelfConsistentSolverBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(0) = self.maximum_iterations {
            return Err("maximum_iterations must be at least 1".to_string());
        }
        if let Some(tol) = self.relative_tolerance {
            if !(tol > 0.0) {
                return Err(format!("relative_tolerance must be positive, not {}", tol));
            }
        }
        Ok(())
    }

    /// Build the solver
    pub fn build(&self) -> Result<SelfConsistentSolver> {
        Ok(self.build_inner()?)
    }
}

impl Default for SelfConsistentSolver {
    fn default() -> Self {
        Self {
            maximum_iterations: DEFAULT_MAXIMUM_ITERATIONS,
            relative_tolerance: DEFAULT_RELATIVE_TOLERANCE,
        }
    }
}

impl SelfConsistentSolver {
    /// Get a new builder for the solver
    pub fn builder() -> SelfConsistentSolverBuilder {
        SelfConsistentSolverBuilder::default()
    }

    /// The iteration limit
    pub fn maximum_iterations(&self) -> usize {
        self.maximum_iterations
    }

    /// The convergence criterion
    pub fn relative_tolerance(&self) -> f64 {
        self.relative_tolerance
    }

    /// Initial guess for the free energies
    fn initial_f_k(
        u_kn: ArrayView2<'_, f64>,
        n_k: ArrayView1<'_, usize>,
        initialize: &InitialFreeEnergies,
    ) -> Result<Array1<f64>> {
        let k = n_k.len();
        match initialize {
            InitialFreeEnergies::Specified(energies) => {
                if energies.len() != k {
                    return Err(MBarError::ArrayLengthMismatch(energies.len(), k));
                }
                Ok(Array1::from(energies.clone()))
            }
            InitialFreeEnergies::Zeros => Ok(Array1::zeros(k)),
            InitialFreeEnergies::BAR => Ok(bar_chain(u_kn, n_k)),
        }
    }
}

impl Solver for SelfConsistentSolver {
    fn solve(
        &self,
        u_kn: ArrayView2<'_, f64>,
        n_k: ArrayView1<'_, usize>,
        initialize: &InitialFreeEnergies,
    ) -> Result<Solution> {
        check_counts(u_kn, n_k)?;
        let k = n_k.len();
        if k == 0 || u_kn.len_of(Axis(1)) == 0 {
            return Err(MBarError::ShapeMismatch(
                "at least one state and one sample are required".to_string(),
            ));
        }

        let log_n_k = n_k.mapv(|n| (n as f64).ln());
        let mut f_k = Self::initial_f_k(u_kn, n_k, initialize)?;
        let f_0 = f_k[0];
        f_k.mapv_inplace(|f| f - f_0);

        let mut residual = std::f64::INFINITY;
        for iteration in 0..self.maximum_iterations {
            let log_denom_n = log_denominators(u_kn, log_n_k.view(), f_k.view());
            let mut f_new = self_consistent_update(u_kn, log_denom_n.view());
            let f_0 = f_new[0];
            f_new.mapv_inplace(|f| f - f_0);

            let max_delta = (&f_new - &f_k).fold(0.0_f64, |m, d| m.max(d.abs()));
            let scale = f_new.fold(0.0_f64, |m, f| m.max(f.abs())).max(1.0);
            residual = max_delta / scale;
            f_k = f_new;

            if iteration % 100 == 0 {
                log::debug!("iteration {}: relative change {:e}", iteration, residual);
            }
            if !residual.is_finite() {
                break;
            }
            if residual < self.relative_tolerance {
                log::info!(
                    "self-consistent iteration converged after {} iterations",
                    iteration + 1
                );
                let log_denom_n = log_denominators(u_kn, log_n_k.view(), f_k.view());
                let w_kn = Array2::from_shape_fn(u_kn.dim(), |(i, n)| {
                    (f_k[i] - u_kn[[i, n]] - log_denom_n[n]).exp()
                });
                return Ok(Solution {
                    f_k,
                    w_kn,
                    n_k: n_k.to_owned(),
                });
            }
        }

        Err(MBarError::Convergence {
            iterations: self.maximum_iterations,
            residual,
        })
    }
}

/// $\ln \sum_k N_k \exp(f_k - u_{kn})$ for every frame, ignoring unsampled states
fn log_denominators(
    u_kn: ArrayView2<'_, f64>,
    log_n_k: ArrayView1<'_, f64>,
    f_k: ArrayView1<'_, f64>,
) -> Array1<f64> {
    let n_tot = u_kn.len_of(Axis(1));
    Array1::from_shape_fn(n_tot, |n| {
        let terms = Array1::from_shape_fn(log_n_k.len(), |k| {
            log_n_k[k] + f_k[k] - u_kn[[k, n]]
        });
        logsumexp(terms.view())
    })
}

/// Right-hand side of the self-consistent equations
fn self_consistent_update(
    u_kn: ArrayView2<'_, f64>,
    log_denom_n: ArrayView1<'_, f64>,
) -> Array1<f64> {
    Array1::from_shape_fn(u_kn.len_of(Axis(0)), |k| {
        let terms = u_kn.row(k).mapv(|u| -u) - &log_denom_n;
        -logsumexp(terms.view())
    })
}

/// Free energies from BAR between each pair of adjacent states
///
/// Pairs where one side has no samples fall back to exponential averaging from the sampled side;
/// pairs with no samples on either side get no free energy difference.
fn bar_chain(u_kn: ArrayView2<'_, f64>, n_k: ArrayView1<'_, usize>) -> Array1<f64> {
    let k = n_k.len();
    let mut starts = Vec::with_capacity(k);
    let mut start = 0;
    for &n in n_k.iter() {
        starts.push(start);
        start += n;
    }

    let mut f_k = Array1::zeros(k);
    for i in 0..k.saturating_sub(1) {
        let j = i + 1;
        let block_i = starts[i]..starts[i] + n_k[i];
        let block_j = starts[j]..starts[j] + n_k[j];

        let w_f: Array1<f64> = block_i.map(|n| u_kn[[j, n]] - u_kn[[i, n]]).collect();
        let w_r: Array1<f64> = block_j.map(|n| u_kn[[i, n]] - u_kn[[j, n]]).collect();

        let delta_f = match (w_f.is_empty(), w_r.is_empty()) {
            (false, false) => bar(w_f.view(), w_r.view()),
            (false, true) => {
                log::warn!("state {} has no samples; using EXP from state {}", j, i);
                exp_average(w_f.view())
            }
            (true, false) => {
                log::warn!("state {} has no samples; using EXP from state {}", i, j);
                -exp_average(w_r.view())
            }
            (true, true) => 0.0,
        };
        f_k[j] = f_k[i] + delta_f;
    }
    f_k
}

/// Exponential averaging estimate $-\ln \langle e^{-w} \rangle$
fn exp_average(w: ArrayView1<'_, f64>) -> f64 {
    let neg_w = w.mapv(|x| -x);
    -(logsumexp(neg_w.view()) - (w.len() as f64).ln())
}

/// Bennett acceptance ratio estimate of $f_j - f_i$ from forward and reverse work values
///
/// Solves the BAR implicit equation by bisection, which is monotone in the free energy difference.
pub(crate) fn bar(w_f: ArrayView1<'_, f64>, w_r: ArrayView1<'_, f64>) -> f64 {
    let m = (w_f.len() as f64 / w_r.len() as f64).ln();
    let imbalance = |delta_f: f64| {
        let forward = w_f.fold(0.0, |s, &w| s + fermi(m + w - delta_f));
        let reverse = w_r.fold(0.0, |s, &w| s + fermi(-m + w + delta_f));
        forward - reverse
    };

    let exp_f = exp_average(w_f);
    let exp_r = -exp_average(w_r);
    let (mut lo, mut hi) = if exp_f.is_finite() && exp_r.is_finite() {
        (exp_f.min(exp_r), exp_f.max(exp_r))
    } else {
        (-1.0, 1.0)
    };

    let mut step = (hi - lo).max(1.0);
    while imbalance(lo) > 0.0 {
        lo -= step;
        step *= 2.0;
    }
    let mut step = (hi - lo).max(1.0);
    while imbalance(hi) < 0.0 {
        hi += step;
        step *= 2.0;
    }

    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if imbalance(mid) < 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-12 * mid.abs().max(1.0) {
            break;
        }
    }
    0.5 * (lo + hi)
}
