//! Bookkeeping of states and samples, and assembly of the reduced energy matrix.

use crate::errors::*;
use crate::sample::{CachePolicy, Sample};
use crate::solver::{check_counts, InitialFreeEnergies, SelfConsistentSolver, Solver};
use crate::state::State;
use crate::trajectory::{Frame, Trajectory};
use ndarray::{s, Array1, Array2};

/// The reduced energy of every sampled frame under every state
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyMatrix<F = Frame> {
    /// `u_kn[k, n]` is the reduced potential energy of frame `n` evaluated at state `k`
    pub u_kn: Array2<f64>,
    /// `n_k[k]` is the number of frames sampled from state `k`
    ///
    /// Frames are grouped by the state they were sampled from, in the order the states were
    /// added: the first `n_k[0]` frames come from state 0, the next `n_k[1]` from state 1, and so
    /// forth. Within a group, samples keep the order they were added in.
    pub n_k: Array1<usize>,
    /// All sampled frames, in the column order of `u_kn`
    pub trajectory: Trajectory<F>,
}

/// Everything the estimates need from a successful solve
#[derive(Debug, Clone)]
pub(crate) struct Solved<F> {
    pub(crate) u_kn: Array2<f64>,
    pub(crate) n_k: Array1<usize>,
    pub(crate) f_k: Array1<f64>,
    pub(crate) w_kn: Array2<f64>,
    pub(crate) trajectory: Trajectory<F>,
}

/// Multistate reweighting estimator
///
/// Collects thermodynamic states and samples drawn from them, solves the MBAR equations for the
/// free energies of the states, and reweights the pooled samples to new states. See the
/// [`crate::reweight`] module for the estimates available after a call to
/// [`Estimator::optimize`].
///
/// Any change to the states or samples invalidates the previous solve.
///
/// # Notes
///
/// Note that this method assumes the data are uncorrelated.
///
/// Correlated data must be subsampled to extract uncorrelated (effectively independent) samples.
#[derive(Debug)]
pub struct Estimator<F = Frame, S = SelfConsistentSolver> {
    states: Vec<State<F>>,
    samples: Vec<Sample<F>>,
    solver: S,
    cache_policy: CachePolicy,
    next_generation: u64,
    pub(crate) solved: Option<Solved<F>>,
}

impl<F> Estimator<F, SelfConsistentSolver> {
    /// An empty estimator using the native self-consistent solver with default settings
    pub fn new() -> Self {
        Self::with_solver(SelfConsistentSolver::default())
    }
}

impl<F> Default for Estimator<F, SelfConsistentSolver> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F, S> Estimator<F, S> {
    /// An empty estimator that solves the MBAR equations with `solver`
    pub fn with_solver(solver: S) -> Self {
        Self {
            states: Vec::new(),
            samples: Vec::new(),
            solver,
            cache_policy: CachePolicy::default(),
            next_generation: 0,
            solved: None,
        }
    }

    /// The solver used by [`Estimator::optimize`]
    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// How samples decide whether cached energies are still valid
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Change how samples decide whether cached energies are still valid
    pub fn set_cache_policy(&mut self, policy: CachePolicy) {
        self.cache_policy = policy;
    }

    /// The states, in the order they were added
    pub fn states(&self) -> &[State<F>] {
        &self.states
    }

    /// The samples, in the order they were added
    pub fn samples(&self) -> &[Sample<F>] {
        &self.samples
    }

    /// Whether estimates can be made, i.e. nothing has changed since the last successful solve
    pub fn is_solved(&self) -> bool {
        self.solved.is_some()
    }

    /// Add a state; its name must not already be in use
    pub fn add_state(&mut self, mut state: State<F>) -> Result<()> {
        if self.states.iter().any(|s| s.name() == state.name()) {
            return Err(MBarError::DuplicateState(state.name().to_string()));
        }
        state.set_generation(self.next_generation);
        self.next_generation += 1;
        self.states.push(state);
        self.solved = None;
        Ok(())
    }

    /// Remove and return the state named `name`
    pub fn remove_state(&mut self, name: &str) -> Result<State<F>> {
        let index = self
            .states
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| MBarError::NotFound(name.to_string()))?;
        self.solved = None;
        Ok(self.states.remove(index))
    }

    /// Add a sample
    pub fn add_sample(&mut self, sample: Sample<F>) {
        self.samples.push(sample);
        self.solved = None;
    }

    /// Remove and return every sample drawn from the state named `from_state`
    pub fn remove_sample(&mut self, from_state: &str) -> Result<Vec<Sample<F>>> {
        if !self.samples.iter().any(|s| s.from_state() == from_state) {
            return Err(MBarError::NotFound(from_state.to_string()));
        }

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.samples)
            .into_iter()
            .partition(|s| s.from_state() == from_state);
        self.samples = kept;
        self.solved = None;
        Ok(removed)
    }

    pub(crate) fn solved(&self) -> Result<&Solved<F>> {
        self.solved.as_ref().ok_or(MBarError::NotSolved)
    }

    /// The energy matrix `u_kn` used by the last solve
    pub fn u_kn(&self) -> Result<&Array2<f64>> {
        Ok(&self.solved()?.u_kn)
    }

    /// The number of frames from each state used by the last solve
    pub fn n_k(&self) -> Result<&Array1<usize>> {
        Ok(&self.solved()?.n_k)
    }

    /// The dimensionless free energies $f_k$ of the states, relative to the first state
    pub fn f_k(&self) -> Result<&Array1<f64>> {
        Ok(&self.solved()?.f_k)
    }

    /// The normalized weight matrix; `w_kn[k, n]` is the weight of frame `n` in state `k`
    pub fn w_kn(&self) -> Result<&Array2<f64>> {
        Ok(&self.solved()?.w_kn)
    }

    /// All frames used by the last solve, in the column order of `u_kn`
    pub fn merged_trajectory(&self) -> Result<&Trajectory<F>> {
        Ok(&self.solved()?.trajectory)
    }

    /// Total number of frames used by the last solve
    pub fn n_tot(&self) -> Result<usize> {
        Ok(self.solved()?.u_kn.ncols())
    }
}

impl<F: Sync, S> Estimator<F, S> {
    /// Make sure every sample has cached energies for every state
    pub fn compute_energy_matrix(&mut self) {
        let policy = self.cache_policy;
        for sample in self.samples.iter_mut() {
            sample.generate_energy(self.states.iter(), policy);
        }
    }
}

impl<F: Clone, S> Estimator<F, S> {
    /// Assemble the energy matrix from the samples' cached energies
    ///
    /// [`Estimator::compute_energy_matrix`] must have been called since the last state was added,
    /// otherwise the missing energies are reported as a `ShapeMismatch`. So is a sample drawn
    /// from a state that is no longer part of the estimator.
    pub fn build_umat(&self) -> Result<EnergyMatrix<F>> {
        for sample in &self.samples {
            if !self.states.iter().any(|s| s.name() == sample.from_state()) {
                return Err(MBarError::ShapeMismatch(format!(
                    "sample from unknown state {:?}; remove it or add the state",
                    sample.from_state()
                )));
            }
        }

        let grouped: Vec<Vec<&Sample<F>>> = self
            .states
            .iter()
            .map(|state| {
                self.samples
                    .iter()
                    .filter(|s| s.from_state() == state.name())
                    .collect()
            })
            .collect();

        let n_k: Array1<usize> = grouped
            .iter()
            .map(|group| group.iter().map(|s| s.n_frames()).sum::<usize>())
            .collect();
        let n_tot = n_k.sum();

        let mut u_kn = Array2::zeros((self.states.len(), n_tot));
        let mut start = 0;
        for sample in grouped.iter().flatten() {
            let end = start + sample.n_frames();
            for (k, state) in self.states.iter().enumerate() {
                let u_n = sample.energies(state.name()).ok_or_else(|| {
                    MBarError::ShapeMismatch(format!(
                        "sample from {:?} has no energies for state {:?}",
                        sample.from_state(),
                        state.name()
                    ))
                })?;
                if u_n.len() != sample.n_frames() {
                    return Err(MBarError::ShapeMismatch(format!(
                        "sample from {:?} has {} energies for state {:?} but {} frames",
                        sample.from_state(),
                        u_n.len(),
                        state.name(),
                        sample.n_frames()
                    )));
                }
                u_kn.slice_mut(s![k, start..end]).assign(u_n);
            }
            start = end;
        }

        let trajectory = Trajectory::join(grouped.iter().flatten().map(|s| s.trajectory()));

        Ok(EnergyMatrix {
            u_kn,
            n_k,
            trajectory,
        })
    }
}

impl<F: Sync + Clone, S: Solver> Estimator<F, S> {
    /// Evaluate all samples under all states and solve for the free energies of the states
    ///
    /// `initialize` is the initial guess handed to the solver; BAR between adjacent states is the
    /// usual choice. On failure the estimator is left unsolved.
    pub fn optimize(&mut self, initialize: InitialFreeEnergies) -> Result<()> {
        self.solved = None;
        self.compute_energy_matrix();
        let EnergyMatrix {
            u_kn,
            n_k,
            trajectory,
        } = self.build_umat()?;
        check_counts(u_kn.view(), n_k.view())?;

        let solution = self.solver.solve(u_kn.view(), n_k.view(), &initialize)?;
        if solution.f_k.len() != n_k.len() || solution.w_kn.dim() != u_kn.dim() {
            return Err(MBarError::ShapeMismatch(format!(
                "solver returned {} free energies and a {:?} weight matrix for a {:?} energy matrix",
                solution.f_k.len(),
                solution.w_kn.dim(),
                u_kn.dim()
            )));
        }

        log::info!(
            "solved {} states with {} frames: f_k = {}",
            n_k.len(),
            u_kn.ncols(),
            solution.f_k
        );

        self.solved = Some(Solved {
            u_kn,
            n_k,
            f_k: solution.f_k,
            w_kn: solution.w_kn,
            trajectory,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn linear_state(name: &str, temperature: f64, slope: f64) -> State<f64> {
        State::<f64>::new(name, temperature, move |x: &f64| slope * x).unwrap()
    }

    fn three_state_estimator() -> Estimator<f64> {
        let mut estimator = Estimator::new();
        estimator.add_state(linear_state("A", 300.0, 1.0)).unwrap();
        estimator.add_state(linear_state("B", 300.0, 2.0)).unwrap();
        estimator.add_state(linear_state("C", 300.0, 3.0)).unwrap();
        // Added out of state order on purpose
        estimator.add_sample(Sample::new(vec![5.0, 6.0].into(), "C"));
        estimator.add_sample(Sample::new(vec![1.0, 2.0].into(), "A"));
        estimator.add_sample(Sample::new(vec![3.0].into(), "A"));
        estimator.add_sample(Sample::new(vec![4.0].into(), "B"));
        estimator
    }

    #[test]
    fn umat_layout() {
        let mut estimator = three_state_estimator();
        estimator.compute_energy_matrix();
        let EnergyMatrix {
            u_kn,
            n_k,
            trajectory,
        } = estimator.build_umat().unwrap();

        assert_eq!(n_k, array![3, 1, 2]);
        assert_eq!(u_kn.dim(), (3, 6));
        assert_eq!(trajectory.frames(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let beta = estimator.states()[0].beta();
        for k in 0..3 {
            for n in 0..6 {
                let expected = (k + 1) as f64 * trajectory[n] * beta;
                assert!((u_kn[[k, n]] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn umat_without_energies_is_shape_mismatch() {
        let estimator = three_state_estimator();
        match estimator.build_umat() {
            Err(MBarError::ShapeMismatch(_)) => {}
            other => panic!("expected ShapeMismatch, got {:?}", other.map(|m| m.n_k)),
        }
    }

    #[test]
    fn remove_state() {
        let mut estimator = three_state_estimator();
        match estimator.remove_state("D") {
            Err(MBarError::NotFound(name)) => assert_eq!(name, "D"),
            other => panic!("expected NotFound, got {:?}", other),
        }
        assert_eq!(estimator.states().len(), 3);

        let removed = estimator.remove_state("B").unwrap();
        assert_eq!(removed.name(), "B");
        assert_eq!(estimator.states().len(), 2);
        assert!(estimator.states().iter().all(|s| s.name() != "B"));
    }

    #[test]
    fn remove_sample() {
        let mut estimator = three_state_estimator();
        assert!(matches!(
            estimator.remove_sample("D"),
            Err(MBarError::NotFound(_))
        ));
        assert_eq!(estimator.samples().len(), 4);

        let removed = estimator.remove_sample("C").unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(estimator.samples().len(), 3);

        let removed = estimator.remove_sample("A").unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(estimator.samples().len(), 1);
        assert_eq!(estimator.samples()[0].from_state(), "B");
    }

    #[test]
    fn sample_from_removed_state_is_shape_mismatch() {
        let mut estimator = three_state_estimator();
        estimator.optimize(InitialFreeEnergies::BAR).unwrap();

        estimator.remove_state("B").unwrap();
        match estimator.optimize(InitialFreeEnergies::BAR) {
            Err(MBarError::ShapeMismatch(message)) => assert!(message.contains("\"B\"")),
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
        assert!(!estimator.is_solved());

        estimator.remove_sample("B").unwrap();
        estimator.optimize(InitialFreeEnergies::BAR).unwrap();
        assert_eq!(estimator.n_k().unwrap(), &array![3, 2]);
    }

    fn cache_after_replacing_b(policy: CachePolicy) -> f64 {
        let mut estimator = three_state_estimator();
        estimator.set_cache_policy(policy);
        estimator.optimize(InitialFreeEnergies::BAR).unwrap();
        let stale_row = estimator.u_kn().unwrap().row(1).to_owned();

        estimator.remove_state("B").unwrap();
        // Same name, twice the slope
        estimator.add_state(linear_state("B", 300.0, 4.0)).unwrap();
        estimator.optimize(InitialFreeEnergies::BAR).unwrap();

        let u_kn = estimator.u_kn().unwrap();
        // "B" is now last; its row is compared with the energies under the old "B"
        let row = u_kn.row(2);
        row.sum() / stale_row.sum()
    }

    #[test]
    fn cache_by_name_keeps_energies_of_a_replaced_state() {
        let ratio = cache_after_replacing_b(CachePolicy::ByName);
        assert!((ratio - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cache_by_generation_recomputes_a_replaced_state() {
        let ratio = cache_after_replacing_b(CachePolicy::ByGeneration);
        assert!((ratio - 2.0).abs() < 1e-12);
    }

    #[test]
    fn duplicate_state_name() {
        let mut estimator = three_state_estimator();
        assert!(matches!(
            estimator.add_state(linear_state("A", 310.0, 1.0)),
            Err(MBarError::DuplicateState(_))
        ));
        assert_eq!(estimator.states().len(), 3);
    }

    #[test]
    fn compute_energy_matrix_is_idempotent() {
        let mut estimator = three_state_estimator();
        estimator.compute_energy_matrix();
        let before: Vec<Vec<Array1<f64>>> = estimator
            .samples()
            .iter()
            .map(|s| {
                ["A", "B", "C"]
                    .iter()
                    .map(|n| s.energies(n).unwrap().clone())
                    .collect()
            })
            .collect();

        estimator.compute_energy_matrix();
        for (sample, cached) in estimator.samples().iter().zip(before) {
            assert_eq!(sample.cached_states().count(), 3);
            for (name, u_n) in ["A", "B", "C"].iter().zip(cached) {
                assert_eq!(sample.energies(name).unwrap(), &u_n);
            }
        }
    }

    #[test]
    fn queries_need_a_solve() {
        let mut estimator = three_state_estimator();
        assert!(!estimator.is_solved());
        assert!(matches!(estimator.f_k(), Err(MBarError::NotSolved)));

        estimator.optimize(InitialFreeEnergies::BAR).unwrap();
        assert!(estimator.is_solved());
        assert_eq!(estimator.n_tot().unwrap(), 6);
        assert_eq!(estimator.f_k().unwrap().len(), 3);
        assert_eq!(estimator.merged_trajectory().unwrap().n_frames(), 6);

        estimator.add_sample(Sample::new(vec![0.5].into(), "B"));
        assert!(matches!(estimator.w_kn(), Err(MBarError::NotSolved)));

        estimator.optimize(InitialFreeEnergies::Zeros).unwrap();
        assert_eq!(estimator.n_k().unwrap(), &array![3, 2, 2]);
        estimator.remove_state("C").unwrap();
        assert!(matches!(estimator.u_kn(), Err(MBarError::NotSolved)));
    }

    #[test]
    fn linear_states_match_analytical_free_energies() {
        // With E = s x on x >= 0 the partition function is proportional to 1/(beta s), so
        // f_k - f_0 = ln(s_k / s_0).
        let mut estimator = Estimator::new();
        let slopes = [1.0, 1.5, 2.0];
        for (i, &slope) in slopes.iter().enumerate() {
            estimator
                .add_state(linear_state(&format!("s{}", i), 300.0, slope))
                .unwrap();
        }
        let beta = estimator.states()[0].beta();
        for (i, &slope) in slopes.iter().enumerate() {
            // Deterministic quantiles of the exponential distribution of state i
            let frames: Vec<f64> = (0..400)
                .map(|j| -(1.0 - (j as f64 + 0.5) / 400.0).ln() / (beta * slope))
                .collect();
            estimator.add_sample(Sample::new(frames.into(), format!("s{}", i)));
        }
        estimator.optimize(InitialFreeEnergies::default()).unwrap();

        let f_k = estimator.f_k().unwrap();
        for (k, &slope) in slopes.iter().enumerate() {
            assert!((f_k[k] - (slope / slopes[0]).ln()).abs() < 0.05);
        }
    }
}
