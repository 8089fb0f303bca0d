#![warn(rust_2018_idioms, missing_docs, missing_debug_implementations)]

//! Reweighting equilibrium samples from multiple thermodynamic states with the multistate
//! Bennett acceptance ratio (MBAR) method.
//!
//! States are named energy functions at a temperature. Samples are trajectories drawn from one of
//! those states. An [`Estimator`] evaluates every sample in every state, solves the MBAR
//! equations for the free energies of the states, and then reweights the pooled frames to new
//! states: normalized weights, free energies with their gradients, asymptotic covariances,
//! variances of reweighted observables, and effective sample sizes.
//!
//! ```
//! use mbar_reweight::{Estimator, InitialFreeEnergies, Sample, State, Trajectory};
//!
//! # fn main() -> mbar_reweight::errors::Result<()> {
//! let mut estimator = Estimator::new();
//! estimator.add_state(State::<f64>::new("cold", 300.0, |x: &f64| x * x)?)?;
//! estimator.add_state(State::<f64>::new("hot", 350.0, |x: &f64| x * x)?)?;
//!
//! let frames: Trajectory<f64> = (0..50).map(|i| -1.0 + 0.04 * i as f64).collect();
//! estimator.add_sample(Sample::new(frames.clone(), "cold"));
//! estimator.add_sample(Sample::new(frames, "hot"));
//!
//! estimator.optimize(InitialFreeEnergies::BAR)?;
//! assert_eq!(estimator.f_k()?[0], 0.0);
//! # Ok(())
//! # }
//! ```
//!
//! Please reference the following if you use this code in your research:
//!
//! [1] Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
//! equilibrium states. J. Chem. Phys. 129:124105, 2008. <http://dx.doi.org/10.1063/1.2978177>

#[macro_use]
extern crate derive_builder;

pub mod covariance;
pub mod errors;
pub mod estimator;
#[cfg(feature = "pymbar")]
pub mod mbar;
mod numeric;
pub mod reweight;
pub mod sample;
pub mod solver;
pub mod state;
pub mod testsystems;
pub mod trajectory;

pub use crate::errors::{MBarError, Result};
pub use crate::estimator::{EnergyMatrix, Estimator};
pub use crate::reweight::{effective_sample_size, FreeEnergyEstimate, WeightEstimate};
pub use crate::sample::{CachePolicy, Sample};
pub use crate::solver::{InitialFreeEnergies, SelfConsistentSolver, Solution, Solver};
pub use crate::state::{EnergyEvaluator, State, MOLAR_GAS_CONSTANT};
pub use crate::trajectory::{Frame, Trajectory};
