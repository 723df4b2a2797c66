//! Linear algebra helpers for covariance estimation and robust square roots.
//!
//! Public API:
//!     pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn sample_mean(samples: &DMatrix<f64>) -> Result<DVector<f64>>
//!     pub fn sample_covariance(samples: &DMatrix<f64>) -> Result<DMatrix<f64>>
//!
//! Square root pipeline (each step isolated for testing):
//!     - symmetrize()
//!     - chol_sqrt()
//!     - chol_sqrt_with_jitter()
//!     - evd_symmetric_sqrt_with_floor()
//!
//! Strategy:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
//! 4) Symmetric EVD with eigenvalue floor → S = U * sqrt(Λ⁺) * Uᵀ
//!
//! Samples are stored one per column (`d × k`), matching the particle layout.

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector};

use crate::error::{Result, UwbError};

/// Compute a robust square root `S` such that approximately `matrix ≈ S * Sᵀ`.
///
/// Attempts Cholesky decomposition first (yielding L such that matrix = L * L^T). If Cholesky
/// fails, a small diagonal jitter is ramped up geometrically, and as a last resort the square
/// root is computed from the symmetric eigen decomposition with negative eigenvalues floored.
/// This is the factor used to draw samples from a positive semi-definite covariance, where a
/// strict Cholesky factorization may not exist.
///
/// # Arguments
/// * `matrix` - The square, (approximately) symmetric matrix to find the square root of.
///
/// # Returns
/// * A matrix `M` such that `matrix ≈ M * M.transpose()`. The Cholesky result is lower
///   triangular, the eigen decomposition result is symmetric.
///
/// # Panics
/// * If `matrix` is not square.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    assert!(
        matrix.is_square(),
        "matrix_square_root: matrix must be square"
    );
    const INITIAL_JITTER: f64 = 1e-12;
    const MAX_JITTER: f64 = 1e-6;
    const MAX_TRIES: usize = 6;
    const EIGEN_FLOOR: f64 = 1e-12;
    let p = symmetrize(matrix);
    if let Some(s) = chol_sqrt(&p) {
        return s;
    }
    if let Some(s) = chol_sqrt_with_jitter(&p, INITIAL_JITTER, MAX_JITTER, MAX_TRIES) {
        return s;
    }
    evd_symmetric_sqrt_with_floor(&p, EIGEN_FLOOR)
}
/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Reduces the round-off asymmetry that accumulates when covariances are built from outer
/// products.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}
/// Plain Cholesky square root, or None if the matrix is not positive definite.
fn chol_sqrt(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    Cholesky::new(p.clone()).map(|ch| ch.l().into_owned())
}
/// Cholesky with diagonal jitter (geometric ramp). Returns None if all tries fail.
fn chol_sqrt_with_jitter(
    p: &DMatrix<f64>,
    initial_jitter: f64,
    max_jitter: f64,
    max_tries: usize,
) -> Option<DMatrix<f64>> {
    let n = p.nrows();
    let mut jitter = initial_jitter;
    for _ in 0..max_tries {
        let mut pj = p.clone();
        for i in 0..n {
            pj[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(pj) {
            return Some(ch.l().into_owned());
        }
        jitter *= 10.0;
        if jitter > max_jitter {
            break;
        }
    }
    None
}
/// Symmetric EVD square root with eigenvalue flooring:
/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let se = SymmetricEigen::new(p.clone());
    let lambdas = se.eigenvalues.map(|l| l.max(floor).sqrt());
    let u = se.eigenvectors;
    let sigma_half = DMatrix::<f64>::from_diagonal(&lambdas);
    &u * sigma_half * u.transpose()
}
/// Mean of a `d × k` sample matrix (one sample per column).
///
/// # Errors
/// * `InvalidParameter` if the matrix holds no samples.
pub fn sample_mean(samples: &DMatrix<f64>) -> Result<DVector<f64>> {
    if samples.ncols() == 0 {
        return Err(UwbError::invalid("samples", "cannot average an empty sample set"));
    }
    let mut mean = DVector::<f64>::zeros(samples.nrows());
    for column in samples.column_iter() {
        mean += column;
    }
    Ok(mean / samples.ncols() as f64)
}
/// Unbiased sample covariance (`k - 1` denominator) of a `d × k` sample matrix.
///
/// # Errors
/// * `ShapeMismatch` if fewer than two samples are supplied. Callers that know which grid
///   cell the samples belong to should check the count first and report `InsufficientData`.
pub fn sample_covariance(samples: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let k = samples.ncols();
    if k < 2 {
        return Err(UwbError::shape("samples for covariance", 2, k));
    }
    let mean = sample_mean(samples)?;
    let d = samples.nrows();
    let mut cov = DMatrix::<f64>::zeros(d, d);
    for column in samples.column_iter() {
        let diff = column - &mean;
        cov += &diff * diff.transpose();
    }
    Ok(symmetrize(&(cov / (k - 1) as f64)))
}

/* =============================== Tests ==================================== */
