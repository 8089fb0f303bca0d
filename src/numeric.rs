//! Stable reductions shared by the solver and the estimator.

use ndarray::ArrayView1;

/// $\ln \sum_i e^{x_i}$, shifted by the maximum
pub(crate) fn logsumexp(values: ArrayView1<'_, f64>) -> f64 {
    let max = values.fold(std::f64::NEG_INFINITY, |m, &v| m.max(v));
    if !max.is_finite() {
        return max;
    }
    max + values.fold(0.0, |s, &v| s + (v - max).exp()).ln()
}

/// Arithmetic mean of a non-empty view
pub(crate) fn mean(values: ArrayView1<'_, f64>) -> f64 {
    values.sum() / values.len() as f64
}

/// Fermi function $1/(1 + e^x)$ without overflow
pub(crate) fn fermi(x: f64) -> f64 {
    if x > 0.0 {
        let e = (-x).exp();
        e / (1.0 + e)
    } else {
        1.0 / (1.0 + x.exp())
    }
}
