//! Test systems with analytically known free energies.

use crate::errors::*;
use crate::estimator::Estimator;
use crate::sample::Sample;
use crate::state::{State, MOLAR_GAS_CONSTANT};
use crate::trajectory::Trajectory;
use ndarray::{array, Array1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

/// Test cases using harmonic oscillators.
///
/// State `k` is a one-dimensional harmonic well $U_k(x) = \frac{1}{2} K_k (x - O_k)^2$ at a
/// common temperature, so its samples are normally distributed and its free energy is known
/// exactly.
///
/// # Examples
///
/// Generate samples with default parameters and solve for the free energies.
///
/// ```
/// use mbar_reweight::testsystems::*;
/// use mbar_reweight::InitialFreeEnergies;
///
/// let testcase = HarmonicOscillator::default();
/// let mut estimator = testcase.estimator_with_seed(&[100, 200, 300, 400, 500], 0).unwrap();
/// estimator.optimize(InitialFreeEnergies::BAR).unwrap();
///
/// let analytical = testcase.analytical_free_energies();
/// let f_k = estimator.f_k().unwrap();
/// assert!((f_k[4] - analytical[4]).abs() < 0.2);
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct HarmonicOscillator {
    /// Offset parameters for each state, in nm.
    #[builder(default = "array![0.0, 1.0, 2.0, 3.0, 4.0]")]
    o_k: Array1<f64>,

    /// Force constants for each state, in kJ/(mol·nm²).
    #[builder(default = "array![1.0, 2.0, 4.0, 8.0, 16.0]")]
    k_k: Array1<f64>,

    /// Temperature of every state, in K
    #[builder(default = "300.0")]
    temperature: f64,
}

impl HarmonicOscillatorBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(o_k), Some(k_k)) = (&self.o_k, &self.k_k) {
            if o_k.len() != k_k.len() {
                return Err(format!(
                    "o_k and k_k must have equal lengths (not {} and {})",
                    o_k.len(),
                    k_k.len()
                ));
            }
        }
        if let Some(k_k) = &self.k_k {
            if k_k.iter().any(|&k| !(k > 0.0)) {
                return Err("force constants must be positive".to_string());
            }
        }
        if let Some(temperature) = self.temperature {
            if !(temperature > 0.0) {
                return Err(format!("temperature must be positive, not {}", temperature));
            }
        }

        Ok(())
    }

    /// Build the test case
    pub fn build(&self) -> Result<HarmonicOscillator> {
        Ok(self.build_inner()?)
    }
}

impl HarmonicOscillator {
    /// Get a new builder for the `HarmonicOscillator` struct.
    pub fn builder() -> HarmonicOscillatorBuilder {
        HarmonicOscillatorBuilder::default()
    }

    /// Number of states
    pub fn k(&self) -> usize {
        self.o_k.len()
    }

    /// Inverse thermal energy in mol/kJ
    pub fn beta(&self) -> f64 {
        1.0 / (MOLAR_GAS_CONSTANT * self.temperature)
    }

    /// Name of state `k`
    pub fn state_name(k: usize) -> String {
        format!("harmonic-{}", k)
    }

    /// The states of the test case, named by [`HarmonicOscillator::state_name`]
    pub fn states(&self) -> Result<Vec<State<f64>>> {
        self.o_k
            .iter()
            .zip(self.k_k.iter())
            .enumerate()
            .map(|(k, (&o, &spring))| {
                State::new(
                    Self::state_name(k),
                    self.temperature,
                    move |x: &f64| 0.5 * spring * (x - o) * (x - o),
                )
            })
            .collect()
    }

    /// Draw samples from each state with a random seed
    pub fn sample(&self, n_k: &[usize]) -> Result<Vec<Sample<f64>>> {
        self.sample_inner(n_k, &mut StdRng::from_entropy())
    }

    /// Draw samples from each state with a specified seed
    pub fn sample_with_seed(&self, n_k: &[usize], seed: u64) -> Result<Vec<Sample<f64>>> {
        self.sample_inner(n_k, &mut StdRng::seed_from_u64(seed))
    }

    fn sample_inner<R: Rng>(&self, n_k: &[usize], rng: &mut R) -> Result<Vec<Sample<f64>>> {
        if n_k.len() != self.k() {
            return Err(MBarError::ArrayLengthMismatch(n_k.len(), self.k()));
        }

        let beta = self.beta();
        let mut samples = Vec::with_capacity(n_k.len());
        for (k, &n) in n_k.iter().enumerate() {
            let sigma = (1.0 / (beta * self.k_k[k])).sqrt();
            let normal = Normal::new(self.o_k[k], sigma)
                .map_err(|e| MBarError::BuilderError(e.to_string()))?;
            let frames: Trajectory<f64> = (0..n).map(|_| rng.sample(normal)).collect();
            samples.push(Sample::new(frames, Self::state_name(k)));
        }
        Ok(samples)
    }

    /// An estimator holding every state and `n_k[k]` samples from state `k`
    pub fn estimator_with_seed(&self, n_k: &[usize], seed: u64) -> Result<Estimator<f64>> {
        let mut estimator = Estimator::new();
        for state in self.states()? {
            estimator.add_state(state)?;
        }
        for sample in self.sample_with_seed(n_k, seed)? {
            estimator.add_sample(sample);
        }
        Ok(estimator)
    }

    /// Dimensionless free energies of the states relative to state 0
    ///
    /// $f_k = -\ln \sqrt{2 \pi / (\beta K_k)}$
    pub fn analytical_free_energies(&self) -> Array1<f64> {
        let beta = self.beta();
        let f_k = self
            .k_k
            .mapv(|k| -(2.0 * std::f64::consts::PI / (beta * k)).sqrt().ln());
        let f_0 = f_k[0];
        f_k.mapv(|f| f - f_0)
    }

    /// Mean position in each state
    pub fn analytical_means(&self) -> Array1<f64> {
        self.o_k.clone()
    }

    /// Variance of the position in each state
    pub fn analytical_variances(&self) -> Array1<f64> {
        let beta = self.beta();
        self.k_k.mapv(|k| 1.0 / (beta * k))
    }
}

impl Default for HarmonicOscillator {
    fn default() -> Self {
        Self {
            o_k: array![0.0, 1.0, 2.0, 3.0, 4.0],
            k_k: array![1.0, 2.0, 4.0, 8.0, 16.0],
            temperature: 300.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::InitialFreeEnergies;

    #[test]
    fn builder_validates() {
        assert!(HarmonicOscillator::builder()
            .o_k(array![0.0, 1.0])
            .k_k(array![1.0])
            .build()
            .is_err());
        assert!(HarmonicOscillator::builder()
            .o_k(array![0.0])
            .k_k(array![-1.0])
            .build()
            .is_err());

        let testcase = HarmonicOscillator::builder().temperature(310.0).build().unwrap();
        assert_eq!(testcase.k(), 5);
    }

    #[test]
    fn seeded_samples_are_reproducible() {
        let testcase = HarmonicOscillator::default();
        let a = testcase.sample_with_seed(&[5, 5, 5, 5, 5], 42).unwrap();
        let b = testcase.sample_with_seed(&[5, 5, 5, 5, 5], 42).unwrap();
        for (a, b) in a.iter().zip(b.iter()) {
            assert_eq!(a.trajectory(), b.trajectory());
        }
        assert!(matches!(
            testcase.sample_with_seed(&[5], 42),
            Err(MBarError::ArrayLengthMismatch(1, 5))
        ));
    }

    #[test]
    fn recovers_analytical_free_energies() {
        let testcase = HarmonicOscillator::default();
        let mut estimator = testcase
            .estimator_with_seed(&[1000, 1000, 1000, 1000, 1000], 7)
            .unwrap();
        estimator.optimize(InitialFreeEnergies::BAR).unwrap();

        let f_k = estimator.f_k().unwrap();
        let analytical = testcase.analytical_free_energies();
        for k in 0..5 {
            assert!(
                (f_k[k] - analytical[k]).abs() < 0.1,
                "f_k[{}] = {}, expected {}",
                k,
                f_k[k],
                analytical[k]
            );
        }
    }

    #[test]
    fn reweighted_mean_matches_analytical() {
        // Reweight to an unsampled oscillator between the sampled ones
        let testcase = HarmonicOscillator::default();
        let mut estimator = testcase
            .estimator_with_seed(&[1000, 1000, 1000, 1000, 1000], 11)
            .unwrap();
        estimator.optimize(InitialFreeEnergies::BAR).unwrap();

        let beta = testcase.beta();
        let (o_new, k_new) = (1.5, 3.0);
        let x: Array1<f64> = estimator
            .merged_trajectory()
            .unwrap()
            .iter()
            .cloned()
            .collect();
        let u_new = x.mapv(|x| beta * 0.5 * k_new * (x - o_new) * (x - o_new));

        let w = estimator.estimate_weight(u_new.view()).unwrap().weight;
        let mean = x.dot(&w);
        let variance = estimator.compute_variance(u_new.view(), x.view()).unwrap();
        assert!((mean - o_new).abs() < 5.0 * variance.sqrt() + 0.02);

        let f_new = estimator.estimate_free_energy(u_new.view()).unwrap().free_energy;
        let f_expected = -(2.0 * std::f64::consts::PI / (beta * k_new)).sqrt().ln()
            + (2.0 * std::f64::consts::PI / (beta * 1.0)).sqrt().ln();
        assert!((f_new - f_expected).abs() < 0.1);
    }
}
