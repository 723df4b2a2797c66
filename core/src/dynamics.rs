//! Constant velocity motion model with random velocity walk.
//!
//! Positions advance by the current (pre-perturbation) velocity, then every velocity component
//! receives independent `N(0, std²)` noise. The model is stateless apart from `std`; the caller
//! owns positions, velocities and the random number generator.

use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{Result, UwbError};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DynamicModel {
    std: f64,
    noise: Normal<f64>,
}
impl DynamicModel {
    /// # Errors
    /// - `InvalidParameter` if `std` is negative or not finite
    pub fn new(std: f64) -> Result<Self> {
        if !(std.is_finite() && std >= 0.0) {
            return Err(UwbError::invalid("std", format!("must be finite and non-negative, got {std}")));
        }
        let noise = Normal::new(0.0, std).map_err(|e| UwbError::invalid("std", e.to_string()))?;
        Ok(DynamicModel { std, noise })
    }
    pub fn std(&self) -> f64 {
        self.std
    }
    /// Advance a batch of states one step.
    ///
    /// # Arguments
    /// - `position` - `d × N` positions, one entity per column
    /// - `velocity` - `d × N` velocities matching `position`
    ///
    /// # Returns
    /// - `(position + velocity, velocity + noise)`
    pub fn step<R: Rng + ?Sized>(
        &self,
        position: &DMatrix<f64>,
        velocity: &DMatrix<f64>,
        rng: &mut R,
    ) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        if position.shape() != velocity.shape() {
            return Err(UwbError::shape(
                "velocity batch length",
                position.ncols(),
                velocity.ncols(),
            ));
        }
        let next_position = position + velocity;
        let next_velocity = velocity.map(|v| v + self.noise.sample(&mut *rng));
        Ok((next_position, next_velocity))
    }
}
