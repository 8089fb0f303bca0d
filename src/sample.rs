//! Trajectories tagged with the state that generated them, and their cached energies.

use crate::state::State;
use crate::trajectory::{Frame, Trajectory};
use ndarray::Array1;
use std::collections::HashMap;

/// When a sample recomputes energies it has already cached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Cached energies are keyed by state name only and are never recomputed.
    ///
    /// If a state is removed and a different state is later added under the same name, samples
    /// that evaluated the old state keep serving its energies.
    ByName,
    /// Cached energies also remember which insertion of a state produced them, and are
    /// recomputed when a state is re-added under a name that was used before.
    ByGeneration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::ByName
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CachedEnergy {
    generation: u64,
    u_n: Array1<f64>,
}

/// A trajectory sampled from one state
///
/// The reduced energies of its frames under every state the owning estimator knows about are
/// cached on the sample, keyed by state name.
#[derive(Debug, Clone)]
pub struct Sample<F = Frame> {
    trajectory: Trajectory<F>,
    from_state: String,
    energy_data: HashMap<String, CachedEnergy>,
}

impl<F> Sample<F> {
    /// A trajectory that was generated by the state named `from_state`
    pub fn new(trajectory: Trajectory<F>, from_state: impl Into<String>) -> Self {
        Self {
            trajectory,
            from_state: from_state.into(),
            energy_data: HashMap::new(),
        }
    }

    /// The sampled frames
    pub fn trajectory(&self) -> &Trajectory<F> {
        &self.trajectory
    }

    /// Number of frames in the sample
    pub fn n_frames(&self) -> usize {
        self.trajectory.n_frames()
    }

    /// Name of the state the trajectory was generated from
    pub fn from_state(&self) -> &str {
        &self.from_state
    }

    /// Cached reduced energies of every frame under the state named `state_name`
    pub fn energies(&self, state_name: &str) -> Option<&Array1<f64>> {
        self.energy_data.get(state_name).map(|cached| &cached.u_n)
    }

    /// Names of the states with cached energies, in no particular order
    pub fn cached_states(&self) -> impl Iterator<Item = &str> {
        self.energy_data.keys().map(String::as_str)
    }
}

impl<F: Sync> Sample<F> {
    /// Evaluate the trajectory under every state that is not yet cached
    ///
    /// Under [`CachePolicy::ByName`] a cached name is never recomputed. Under
    /// [`CachePolicy::ByGeneration`] entries left behind by an earlier state of the same name are
    /// replaced.
    pub fn generate_energy<'a, I>(&mut self, states: I, policy: CachePolicy)
    where
        I: IntoIterator<Item = &'a State<F>>,
        F: 'a,
    {
        for state in states {
            let stale = match (self.energy_data.get(state.name()), policy) {
                (None, _) => true,
                (Some(_), CachePolicy::ByName) => false,
                (Some(cached), CachePolicy::ByGeneration) => {
                    cached.generation != state.generation()
                }
            };

            if stale {
                log::debug!(
                    "evaluating {} frames from {:?} under state {:?}",
                    self.n_frames(),
                    self.from_state,
                    state.name()
                );
                let u_n = state.evaluate_trajectory(&self.trajectory);
                self.energy_data.insert(
                    state.name().to_string(),
                    CachedEnergy {
                        generation: state.generation(),
                        u_n,
                    },
                );
            }
        }
    }
}
