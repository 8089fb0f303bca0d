use anyhow::Result;
use itertools::{izip, Itertools};
use mbar_reweight::testsystems::*;
use mbar_reweight::InitialFreeEnergies;
use ndarray::{Array1, Array2};

fn main() -> Result<()> {
    // Generate some sample data
    let testcase = HarmonicOscillator::default();
    let mut estimator = testcase.estimator_with_seed(&[100, 200, 300, 400, 500], 2020)?;

    estimator.optimize(InitialFreeEnergies::BAR)?;

    println!("state  f_k (MBAR)  f_k (analytical)  n_eff");
    for (k, f, f_exact, n_eff) in izip!(
        0..testcase.k(),
        estimator.f_k()?.iter(),
        testcase.analytical_free_energies().iter(),
        estimator.n_eff()?.iter()
    ) {
        println!("{:>5}  {:>10.4}  {:>16.4}  {:>5.1}", k, f, f_exact, n_eff);
    }

    // Reweight to an oscillator that was never simulated
    let beta = testcase.beta();
    let (offset, spring) = (2.5, 5.0);
    let x_n: Array1<f64> = estimator.merged_trajectory()?.iter().copied().collect();
    let u_new = x_n.mapv(|x| beta * 0.5 * spring * (x - offset).powi(2));

    let estimate = estimator.estimate_free_energy(u_new.view())?;

    // Derivative of u_new with respect to (offset, spring)
    let jacobian = Array2::from_shape_fn((x_n.len(), 2), |(n, p)| match p {
        0 => -beta * spring * (x_n[n] - offset),
        _ => beta * 0.5 * (x_n[n] - offset).powi(2),
    });
    let gradient = estimate.chain(jacobian.view())?;

    println!(
        "\nf_new = {:.4}, df/d(offset) = {:.4}, df/d(spring) = {:.4}",
        estimate.free_energy, gradient[0], gradient[1]
    );

    let weight = estimator.estimate_weight(u_new.view())?.weight;
    let mean = x_n.dot(&weight);
    let variance = estimator.compute_variance(u_new.view(), x_n.view())?;
    println!("<x>_new = {:.4} +/- {:.4}", mean, variance.sqrt());

    let (n_eff, state_effect) = estimator.estimate_effective_sample_decomposed(u_new.view())?;
    println!(
        "n_eff = {:.1}, top frames by state: [{}]",
        n_eff,
        state_effect.iter().join(", ")
    );

    let theta = estimator.compute_covar_mat(u_new.view())?;
    let last = theta.nrows() - 1;
    println!(
        "uncertainty of f_new - f_0: {:.4}",
        (theta[[last, last]] + theta[[0, 0]] - 2.0 * theta[[0, last]]).sqrt()
    );

    Ok(())
}
