//! Multivariate normal densities and sampling.
//!
//! Densities are evaluated through a strict Cholesky factorization so that a singular
//! covariance is reported as an error instead of silently producing zero or infinite density.
//! Sampling from covariances that are only positive semi-definite goes through the robust
//! square root in [`crate::linalg`].

use std::f64::consts::PI;
use std::fmt::{self, Debug};

use nalgebra::linalg::Cholesky;
use nalgebra::storage::Storage;
use nalgebra::{DMatrix, DVector, Dyn, Matrix, U1};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{Result, UwbError};
use crate::linalg::symmetrize;

/// Relative size of the smallest Cholesky pivot below which a covariance is treated as singular
const SINGULAR_PIVOT_RATIO: f64 = 1.0e-8;

/// Multivariate normal distribution with a validated, factored covariance
#[derive(Clone, PartialEq)]
pub struct MultivariateNormal {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    lower: DMatrix<f64>,
    log_normalizer: f64,
}
impl Debug for MultivariateNormal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultivariateNormal")
            .field("mean", &self.mean.as_slice())
            .field("variances", &self.covariance.diagonal().as_slice())
            .finish()
    }
}
impl MultivariateNormal {
    /// Create a new distribution.
    ///
    /// # Arguments
    /// - `mean` - mean vector of length `d`
    /// - `covariance` - `d × d` symmetric positive definite covariance
    ///
    /// # Errors
    /// - `ShapeMismatch` if the covariance is not `d × d`
    /// - `InvalidParameter` if any entry is not finite
    /// - `SingularCovariance` if the covariance cannot be Cholesky factored
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> Result<Self> {
        let d = mean.len();
        if covariance.nrows() != d {
            return Err(UwbError::shape("covariance rows", d, covariance.nrows()));
        }
        if covariance.ncols() != d {
            return Err(UwbError::shape("covariance columns", d, covariance.ncols()));
        }
        if mean.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
            return Err(UwbError::invalid("gaussian", "mean and covariance must be finite"));
        }
        let covariance = symmetrize(&covariance);
        let lower = Cholesky::new(covariance.clone())
            .map(|ch| ch.l())
            .ok_or_else(|| UwbError::SingularCovariance {
                context: format!("{d}x{d} covariance is not positive definite"),
            })?;
        let pivots = lower.diagonal();
        let largest = pivots.max();
        if pivots.min() <= SINGULAR_PIVOT_RATIO * largest {
            return Err(UwbError::SingularCovariance {
                context: format!("{d}x{d} covariance is numerically rank deficient"),
            });
        }
        let log_det: f64 = 2.0 * pivots.iter().map(|p| p.ln()).sum::<f64>();
        let log_normalizer = -0.5 * (d as f64 * (2.0 * PI).ln() + log_det);
        Ok(MultivariateNormal {
            mean,
            covariance,
            lower,
            log_normalizer,
        })
    }
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
    pub fn dimension(&self) -> usize {
        self.mean.len()
    }
    /// Natural log of the density at `x`
    pub fn log_pdf<S>(&self, x: &Matrix<f64, Dyn, U1, S>) -> Result<f64>
    where
        S: Storage<f64, Dyn, U1>,
    {
        if x.len() != self.mean.len() {
            return Err(UwbError::shape("density argument", self.mean.len(), x.len()));
        }
        let diff: DVector<f64> = x - &self.mean;
        let whitened = self
            .lower
            .solve_lower_triangular(&diff)
            .ok_or_else(|| UwbError::SingularCovariance {
                context: "triangular solve failed".to_string(),
            })?;
        Ok(self.log_normalizer - 0.5 * whitened.norm_squared())
    }
    /// Density at `x`
    pub fn pdf<S>(&self, x: &Matrix<f64, Dyn, U1, S>) -> Result<f64>
    where
        S: Storage<f64, Dyn, U1>,
    {
        Ok(self.log_pdf(x)?.exp())
    }
    /// Draw one sample
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        sample_with_root(&self.mean, &self.lower, rng)
    }
}

/// Draw `mean + S z` with `z ~ N(0, I)`, where `S` is any square root of the covariance.
pub fn sample_with_root<R: Rng + ?Sized>(
    mean: &DVector<f64>,
    root: &DMatrix<f64>,
    rng: &mut R,
) -> DVector<f64> {
    let z = DVector::<f64>::from_fn(root.ncols(), |_, _| StandardNormal.sample(&mut *rng));
    mean + root * z
}

/// Numerically stable `ln(Σ exp(v))`. Returns `-∞` for an empty slice or all `-∞` inputs.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY || max.is_nan() {
        return max;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}
