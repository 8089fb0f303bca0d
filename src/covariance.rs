//! Asymptotic covariance of free energy estimates from a weight matrix.

use crate::errors::*;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Relative cutoff for singular values in the pseudo-inverse
pub const PINV_RCOND: f64 = 1e-10;

/// Compute the asymptotic covariance matrix $\Theta$ of the dimensionless free energies
///
/// # Parameters
///
/// * `w_kn[k, n]` is the normalized weight of frame `n` in state `k`; rows may include
///   states with no samples of their own, such as a reweighted target state
/// * `n_k[k]` is the number of frames sampled from state `k`, zero for appended rows
///
/// # Notes
///
/// Uses the eigenvalue decomposition $W W^T = V S^2 V^T$ to avoid a full singular value
/// decomposition of the $K \times N$ weight matrix (Appendix D.1, Eqs. D4 and D5 of Shirts &
/// Chodera 2008):
///
/// $$
///     \Theta = V \Sigma (I - \Sigma V^T \mathrm{diag}(N_k) V \Sigma)^+ \Sigma V^T
/// $$
///
/// Negative eigenvalues of $W W^T$ are round-off and are clipped to zero. The pseudo-inverse
/// discards singular values below `PINV_RCOND` times the largest one.
pub fn compute_covariance(w_kn: ArrayView2<'_, f64>, n_k: ArrayView1<'_, f64>) -> Result<Array2<f64>> {
    let k = w_kn.len_of(Axis(0));
    if n_k.len() != k {
        return Err(MBarError::ArrayLengthMismatch(n_k.len(), k));
    }

    let wwt = w_kn.dot(&w_kn.t());
    let wwt = DMatrix::from_fn(k, k, |i, j| wwt[[i, j]]);

    let SymmetricEigen {
        eigenvectors: v,
        mut eigenvalues,
    } = SymmetricEigen::new(wwt);

    let clipped = eigenvalues.iter().filter(|&&s2| s2 < 0.0).count();
    if clipped > 0 {
        log::debug!("clipping {} negative eigenvalues of W W^T to zero", clipped);
    }
    eigenvalues.apply(|s2| {
        if *s2 < 0.0 {
            *s2 = 0.0
        }
    });
    let sigma = DMatrix::from_diagonal(&eigenvalues.map(f64::sqrt));
    let n_diag = DMatrix::from_fn(k, k, |i, j| if i == j { n_k[i] } else { 0.0 });

    let inner = DMatrix::identity(k, k) - &sigma * v.transpose() * n_diag * &v * &sigma;
    let inner_pinv = pinv(inner, PINV_RCOND)?;
    let theta = &v * &sigma * inner_pinv * &sigma * v.transpose();

    Ok(Array2::from_shape_fn((k, k), |(i, j)| theta[(i, j)]))
}

/// Moore-Penrose pseudo-inverse with a cutoff relative to the largest singular value
fn pinv(matrix: DMatrix<f64>, rcond: f64) -> Result<DMatrix<f64>> {
    let svd = matrix.svd(true, true);
    let largest = svd.singular_values.max();
    let cutoff = if largest > 0.0 { rcond * largest } else { 0.0 };
    svd.pseudo_inverse(cutoff).map_err(MBarError::Linalg)
}
