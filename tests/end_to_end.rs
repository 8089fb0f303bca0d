use anyhow::Result;
use mbar_reweight::*;
use ndarray::Array1;

const N_FRAMES: usize = 100;

/// Frames at evenly spaced quantiles of the Boltzmann distribution of E = x at temperature `t`
fn quantile_frames(t: f64) -> Trajectory<f64> {
    let beta = 1.0 / (MOLAR_GAS_CONSTANT * t);
    (0..N_FRAMES)
        .map(|j| -(1.0 - (j as f64 + 0.5) / N_FRAMES as f64).ln() / beta)
        .collect()
}

fn two_temperatures() -> Result<Estimator<f64>> {
    let mut estimator = Estimator::new();
    for &(name, t) in &[("A", 300.0), ("B", 310.0)] {
        estimator.add_state(State::<f64>::new(name, t, |x: &f64| *x)?)?;
        estimator.add_sample(Sample::new(quantile_frames(t), name));
    }
    Ok(estimator)
}

#[test]
fn solve_and_reweight_to_a_sampled_state() -> Result<()> {
    let mut estimator = two_temperatures()?;
    estimator.optimize(InitialFreeEnergies::BAR)?;

    assert_eq!(estimator.n_k()?.sum(), 2 * N_FRAMES);
    assert_eq!(estimator.n_tot()?, 2 * N_FRAMES);
    assert_eq!(estimator.u_kn()?.dim(), (2, 2 * N_FRAMES));
    assert_eq!(estimator.merged_trajectory()?.n_frames(), 2 * N_FRAMES);

    // Reweighting to state A reproduces its row of the weight matrix
    let u_a = estimator.u_kn()?.row(0).to_owned();
    let estimate = estimator.estimate_weight(u_a.view())?;
    for (w, expected) in estimate.weight.iter().zip(estimator.w_kn()?.row(0).iter()) {
        assert!((w - expected).abs() < 1e-8);
    }

    // and its free energy is f_A
    let f_a = estimator.estimate_free_energy(u_a.view())?.free_energy;
    assert!(f_a.abs() < 1e-8);

    // For E = x the partition function is R T, so f_B - f_A = -ln(310 / 300)
    let f_k = estimator.f_k()?;
    assert!((f_k[1] + (310.0_f64 / 300.0).ln()).abs() < 0.01);

    Ok(())
}

#[test]
fn estimates_between_sampled_states() -> Result<()> {
    let mut estimator = two_temperatures()?;
    estimator.optimize(InitialFreeEnergies::Zeros)?;

    let beta = 1.0 / (MOLAR_GAS_CONSTANT * 305.0);
    let x_n: Array1<f64> = estimator.merged_trajectory()?.iter().copied().collect();
    let u_new = x_n.mapv(|x| beta * x);

    let n_eff = estimator.estimate_effective_sample(u_new.view())?;
    assert!(n_eff > 0.5 * (2 * N_FRAMES) as f64);
    assert!(n_eff <= (2 * N_FRAMES) as f64 + 1e-9);

    let (n_eff_decomposed, state_effect) =
        estimator.estimate_effective_sample_decomposed(u_new.view())?;
    assert!((n_eff_decomposed - n_eff).abs() < 1e-12);
    assert_eq!(state_effect.len(), 2);
    assert_eq!(
        state_effect.sum(),
        ((n_eff.ceil() as usize) + 1).min(2 * N_FRAMES)
    );

    let theta = estimator.compute_covar_mat(u_new.view())?;
    assert_eq!(theta.dim(), (3, 3));

    // Mean energy at 305 K is R T
    let weight = estimator.estimate_weight(u_new.view())?.weight;
    let mean = x_n.dot(&weight);
    assert!((mean - MOLAR_GAS_CONSTANT * 305.0).abs() < 0.05 * MOLAR_GAS_CONSTANT * 305.0);

    let variance = estimator.compute_variance(u_new.view(), x_n.view())?;
    assert!(variance.is_finite());
    assert!(variance >= -1e-12);

    Ok(())
}

#[test]
fn removing_states_and_samples() -> Result<()> {
    let mut estimator = two_temperatures()?;
    estimator.optimize(InitialFreeEnergies::BAR)?;

    let removed = estimator.remove_sample("B")?;
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].n_frames(), N_FRAMES);
    assert!(!estimator.is_solved());
    assert!(matches!(estimator.f_k(), Err(MBarError::NotSolved)));

    let state = estimator.remove_state("B")?;
    assert_eq!(state.name(), "B");
    assert_eq!(estimator.states().len(), 1);

    assert!(matches!(
        estimator.remove_state("B"),
        Err(MBarError::NotFound(_))
    ));
    assert!(matches!(
        estimator.remove_sample("B"),
        Err(MBarError::NotFound(_))
    ));

    estimator.optimize(InitialFreeEnergies::BAR)?;
    assert_eq!(estimator.n_tot()?, N_FRAMES);
    assert_eq!(estimator.f_k()?.len(), 1);

    Ok(())
}

#[test]
fn parameter_gradient_matches_finite_difference() -> Result<()> {
    let mut estimator = two_temperatures()?;
    estimator.optimize(InitialFreeEnergies::BAR)?;

    let x_n: Array1<f64> = estimator.merged_trajectory()?.iter().copied().collect();
    let beta = 1.0 / (MOLAR_GAS_CONSTANT * 300.0);
    let u_of = |slope: f64| x_n.mapv(|x| beta * slope * x);

    let slope = 1.05;
    let estimate = estimator.estimate_free_energy(u_of(slope).view())?;
    let jacobian = x_n.mapv(|x| beta * x).into_shape((x_n.len(), 1))?;
    let gradient = estimate.chain(jacobian.view())?;

    let h = 1e-5;
    let f_plus = estimator.estimate_free_energy(u_of(slope + h).view())?.free_energy;
    let f_minus = estimator.estimate_free_energy(u_of(slope - h).view())?.free_energy;
    let numeric = (f_plus - f_minus) / (2.0 * h);

    assert!((gradient[0] - numeric).abs() < 1e-5 * numeric.abs().max(1.0));

    Ok(())
}
