//! Weight degeneracy diagnostics.
//!
//! Used by the tracking loop to decide when to resample; the filter never calls these itself.

use nalgebra::DVector;

/// Coefficient of variation of a normalized weight vector, `mean((M w - 1)²)`.
///
/// Zero for uniform weights, `M - 1` when a single particle carries all weight. Returns 0.0 for
/// an empty vector.
pub fn coefficient_of_variation(weights: &DVector<f64>) -> f64 {
    let m = weights.len();
    if m == 0 {
        return 0.0;
    }
    let mf = m as f64;
    weights.iter().map(|w| (mf * w - 1.0).powi(2)).sum::<f64>() / mf
}

/// Effective sample size, `M / (1 + CV)`.
///
/// For normalized weights this equals `1 / Σ w²`: `M` for uniform weights and 1 for a fully
/// degenerate set.
pub fn effective_sample_size(weights: &DVector<f64>) -> f64 {
    weights.len() as f64 / (1.0 + coefficient_of_variation(weights))
}
