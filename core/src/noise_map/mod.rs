//! Learned, grid-indexed measurement models.
//!
//! A noise map is fitted once from a [`GridMeasurementSource`] and then answers two queries for
//! the particle filter:
//! - the likelihood of a measurement given a particle position (`conditioned_probability`)
//! - a draw of a measured position given a true position (`sample_from`)
//!
//! Both queries locate the closest grid cell of each particle/coordinate and evaluate that cell's
//! model on the offset from the cell anchor. Two models are provided:
//! - [`GaussianNoiseMap`]: one Gaussian per cell
//! - [`MixtureNoiseMap`]: a Gaussian mixture per cell, with components found by [`dbscan`]

pub mod dbscan;
pub mod mixture;
pub mod normal;

use std::fmt::Debug;

use nalgebra::{DMatrix, DVector};
use rand::RngCore;

use crate::error::{Result, UwbError};
use crate::grid::Grid;
use crate::source::GridMeasurementSource;

pub use mixture::{MixtureComponent, MixtureConfig, MixtureNoiseMap};
pub use normal::GaussianNoiseMap;

/// Capability set shared by every noise map. The particle filter only sees this interface.
pub trait NoiseMap: Debug {
    /// Grid the map is indexed by
    fn grid(&self) -> &Grid;
    fn is_fitted(&self) -> bool;
    /// Estimate every cell model from a single traversal of `source`.
    ///
    /// Fitting is all or nothing: on error the map keeps its previous state.
    fn fit(&mut self, source: &dyn GridMeasurementSource) -> Result<()>;
    /// Natural log of the likelihood of each measurement `z[:, j]` given particle
    /// `particles[:, j]`.
    ///
    /// # Arguments
    /// - `z` - `d × N` measurements
    /// - `particles` - `d × N` particle positions paired column-wise with `z`
    ///
    /// # Returns
    /// - `N` log likelihoods. `-∞` marks a pair with zero likelihood.
    fn log_conditioned_probability(
        &self,
        z: &DMatrix<f64>,
        particles: &DMatrix<f64>,
    ) -> Result<DVector<f64>>;
    /// Likelihood of each measurement given its paired particle, see
    /// [`NoiseMap::log_conditioned_probability`].
    fn conditioned_probability(
        &self,
        z: &DMatrix<f64>,
        particles: &DMatrix<f64>,
    ) -> Result<DVector<f64>> {
        Ok(self.log_conditioned_probability(z, particles)?.map(f64::exp))
    }
    /// Draw one measured position per column of `coordinates` (`d × N`), returned as absolute
    /// positions (`d × N`).
    fn sample_from(
        &self,
        coordinates: &DMatrix<f64>,
        rng: &mut dyn RngCore,
    ) -> Result<DMatrix<f64>>;
}

/// Shared argument checks for the likelihood query
pub(crate) fn check_pairs(grid: &Grid, z: &DMatrix<f64>, particles: &DMatrix<f64>) -> Result<()> {
    let d = grid.dimension();
    if z.nrows() != d {
        return Err(UwbError::shape("measurement dimension", d, z.nrows()));
    }
    if particles.nrows() != d {
        return Err(UwbError::shape("particle dimension", d, particles.nrows()));
    }
    if z.ncols() != particles.ncols() {
        return Err(UwbError::shape(
            "measurement/particle batch length",
            particles.ncols(),
            z.ncols(),
        ));
    }
    Ok(())
}

/// Visit bookkeeping used while fitting: every cell exactly once.
pub(crate) struct Traversal {
    visited: Vec<bool>,
    count: usize,
}
impl Traversal {
    pub(crate) fn new(num_cells: usize) -> Self {
        Traversal {
            visited: vec![false; num_cells],
            count: 0,
        }
    }
    pub(crate) fn visit(&mut self, flat: usize) -> Result<()> {
        if self.visited[flat] {
            return Err(UwbError::IncompleteTraversal {
                visited: self.count,
                expected: self.visited.len(),
            });
        }
        self.visited[flat] = true;
        self.count += 1;
        Ok(())
    }
    pub(crate) fn finish(self) -> Result<()> {
        if self.count != self.visited.len() {
            return Err(UwbError::IncompleteTraversal {
                visited: self.count,
                expected: self.visited.len(),
            });
        }
        Ok(())
    }
}

/// Reject a source whose grid disagrees with the map's grid.
pub(crate) fn check_source(grid: &Grid, source: &dyn GridMeasurementSource) -> Result<()> {
    if source.shape() != grid.dims() {
        return Err(UwbError::shape(
            "grid cells of measurement source",
            grid.num_cells(),
            source.shape().iter().product(),
        ));
    }
    if source.grid() != grid {
        return Err(UwbError::invalid(
            "measurement source",
            format!(
                "grid spacing {} does not match the map grid spacing {}",
                source.grid().step(),
                grid.step()
            ),
        ));
    }
    Ok(())
}
