//! Gaussian mixture noise map for multi-modal (multipath) measurement noise.
//!
//! Each cell's samples are clustered with [`Dbscan`]. Noise samples and clusters smaller than
//! `min_cluster_size` are dropped, and every remaining cluster becomes one mixture component
//! weighted by its share of the retained samples. Components of all cells live in one flat
//! arena; each cell owns a contiguous range of it.

use std::ops::Range;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::{Rng, RngCore};

use crate::error::{Result, UwbError};
use crate::gaussian::{MultivariateNormal, log_sum_exp};
use crate::grid::{CellIndex, Grid};
use crate::linalg::{sample_covariance, sample_mean};
use crate::noise_map::dbscan::Dbscan;
use crate::noise_map::{NoiseMap, Traversal, check_pairs, check_source};
use crate::source::GridMeasurementSource;

/// Clustering parameters of a [`MixtureNoiseMap`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MixtureConfig {
    /// Neighbourhood radius
    pub eps: f64,
    /// Samples within `eps` (self included) that make a core sample. Cells with fewer samples
    /// in total get no components.
    pub min_samples: usize,
    /// Smallest cluster kept as a component
    pub min_cluster_size: usize,
}
impl Default for MixtureConfig {
    fn default() -> Self {
        MixtureConfig {
            eps: 1.5,
            min_samples: 4,
            min_cluster_size: 3,
        }
    }
}
impl MixtureConfig {
    pub fn validate(&self) -> Result<()> {
        Dbscan::new(self.eps, self.min_samples)?;
        if self.min_cluster_size < 2 {
            return Err(UwbError::invalid(
                "min_cluster_size",
                "a covariance needs clusters of at least 2 samples",
            ));
        }
        Ok(())
    }
}

/// One weighted Gaussian of a cell's mixture, expressed as an offset from the cell anchor
#[derive(Clone, Debug)]
pub struct MixtureComponent {
    weight: f64,
    size: usize,
    density: MultivariateNormal,
}
impl MixtureComponent {
    pub fn weight(&self) -> f64 {
        self.weight
    }
    /// Number of samples in the cluster behind this component
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn mean_offset(&self) -> &DVector<f64> {
        self.density.mean()
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        self.density.covariance()
    }
}

/// Per-cell Gaussian mixture measurement model
#[derive(Clone, Debug)]
pub struct MixtureNoiseMap {
    grid: Grid,
    config: MixtureConfig,
    dbscan: Dbscan,
    cells: Vec<Range<usize>>,
    components: Vec<MixtureComponent>,
    fitted: bool,
}
impl MixtureNoiseMap {
    pub fn new(grid: Grid, config: MixtureConfig) -> Result<Self> {
        config.validate()?;
        let dbscan = Dbscan::new(config.eps, config.min_samples)?;
        Ok(MixtureNoiseMap {
            cells: vec![0..0; grid.num_cells()],
            components: Vec::new(),
            fitted: false,
            grid,
            config,
            dbscan,
        })
    }
    /// Allocate a map matching the grid of `source` and fit it.
    pub fn from_source(source: &dyn GridMeasurementSource, config: MixtureConfig) -> Result<Self> {
        let mut map = MixtureNoiseMap::new(source.grid().clone(), config)?;
        map.fit(source)?;
        Ok(map)
    }
    pub fn config(&self) -> &MixtureConfig {
        &self.config
    }
    /// Components of `cell`, empty when no cluster qualified
    pub fn components(&self, cell: &CellIndex) -> Result<&[MixtureComponent]> {
        let flat = self.grid.flat_index(cell)?;
        Ok(&self.components[self.cells[flat].clone()])
    }
    /// Total number of components across all cells
    pub fn num_components(&self) -> usize {
        self.components.len()
    }
    /// Number of cells without a model
    pub fn empty_cells(&self) -> usize {
        self.cells.iter().filter(|r| r.is_empty()).count()
    }
    fn require_fitted(&self) -> Result<()> {
        if !self.fitted {
            return Err(UwbError::MissingModel {
                context: "gaussian mixture noise map has not been fitted".to_string(),
            });
        }
        Ok(())
    }
    /// Cluster one cell's samples into weighted components.
    fn fit_cell(
        &self,
        cell: &CellIndex,
        samples: &DMatrix<f64>,
        anchor: &DVector<f64>,
    ) -> Result<Vec<MixtureComponent>> {
        if samples.ncols() < self.config.min_samples {
            warn!(
                "Cell {cell} has {} samples, fewer than min_samples {}; no model",
                samples.ncols(),
                self.config.min_samples
            );
            return Ok(Vec::new());
        }
        let clustering = self.dbscan.fit(samples);
        let mut kept = Vec::new();
        for c in 0..clustering.num_clusters {
            let members = clustering.members(c);
            if members.len() < self.config.min_cluster_size {
                continue;
            }
            let cluster = samples.select_columns(members.iter());
            let mean = sample_mean(&cluster)? - anchor;
            let covariance = sample_covariance(&cluster)?;
            match MultivariateNormal::new(mean, covariance) {
                Ok(density) => kept.push((members.len(), density)),
                Err(e) => warn!("Dropping cluster {c} of cell {cell}: {e}"),
            }
        }
        let retained: usize = kept.iter().map(|(size, _)| size).sum();
        debug!(
            "Cell {cell}: {} clusters, {} kept, {} noise samples",
            clustering.num_clusters,
            kept.len(),
            clustering.noise_count()
        );
        Ok(kept
            .into_iter()
            .map(|(size, density)| MixtureComponent {
                weight: size as f64 / retained as f64,
                size,
                density,
            })
            .collect())
    }
}

impl NoiseMap for MixtureNoiseMap {
    fn grid(&self) -> &Grid {
        &self.grid
    }
    fn is_fitted(&self) -> bool {
        self.fitted
    }
    fn fit(&mut self, source: &dyn GridMeasurementSource) -> Result<()> {
        check_source(&self.grid, source)?;
        let d = self.grid.dimension();
        let n = self.grid.num_cells();
        let mut per_cell: Vec<Vec<MixtureComponent>> = vec![Vec::new(); n];
        let mut traversal = Traversal::new(n);
        for record in source.records() {
            let flat = self.grid.flat_index(&record.cell)?;
            traversal.visit(flat)?;
            if record.samples.nrows() != d {
                return Err(UwbError::shape(
                    format!("sample dimension in cell {}", record.cell),
                    d,
                    record.samples.nrows(),
                ));
            }
            per_cell[flat] = self.fit_cell(&record.cell, &record.samples, &record.anchor)?;
        }
        traversal.finish()?;

        let mut cells = Vec::with_capacity(n);
        let mut components = Vec::new();
        for cell_components in per_cell {
            let start = components.len();
            components.extend(cell_components);
            cells.push(start..components.len());
        }
        self.cells = cells;
        self.components = components;
        self.fitted = true;
        info!(
            "Fitted gaussian mixture noise map over {}: {} components, {} cells without a model",
            self.grid,
            self.components.len(),
            self.empty_cells()
        );
        Ok(())
    }
    fn log_conditioned_probability(
        &self,
        z: &DMatrix<f64>,
        particles: &DMatrix<f64>,
    ) -> Result<DVector<f64>> {
        self.require_fitted()?;
        check_pairs(&self.grid, z, particles)?;
        let (cells, anchors) = self.grid.closest_cell(particles)?;
        let mut log_probabilities = DVector::zeros(particles.ncols());
        let mut terms = Vec::new();
        for (j, cell) in cells.iter().enumerate() {
            let range = self.cells[self.grid.flat_index(cell)?].clone();
            let offset = z.column(j) - anchors.column(j);
            terms.clear();
            for component in &self.components[range] {
                terms.push(component.weight.ln() + component.density.log_pdf(&offset)?);
            }
            // an empty cell yields -inf, i.e. zero likelihood
            log_probabilities[j] = log_sum_exp(&terms);
        }
        Ok(log_probabilities)
    }
    fn sample_from(
        &self,
        coordinates: &DMatrix<f64>,
        rng: &mut dyn RngCore,
    ) -> Result<DMatrix<f64>> {
        self.require_fitted()?;
        let (cells, anchors) = self.grid.closest_cell(coordinates)?;
        let mut samples = anchors;
        for (j, cell) in cells.iter().enumerate() {
            let components = &self.components[self.cells[self.grid.flat_index(cell)?].clone()];
            let Some(last) = components.last() else {
                return Err(UwbError::MissingModel {
                    context: format!("cell {cell} has no mixture components"),
                });
            };
            let u: f64 = rng.random();
            let mut cumulative = 0.0;
            let mut chosen = last;
            for component in components {
                cumulative += component.weight;
                if u < cumulative {
                    chosen = component;
                    break;
                }
            }
            let absolute = samples.column(j) + chosen.density.sample(rng);
            samples.set_column(j, &absolute);
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use crate::source::RecordedGrid;

    const BLOB_A: [(f64, f64); 6] = [
        (0.1, 0.0),
        (-0.1, 0.0),
        (0.0, 0.1),
        (0.0, -0.1),
        (0.1, 0.1),
        (-0.1, -0.1),
    ];
    const BLOB_B: [(f64, f64); 4] = [(0.1, 0.0), (-0.1, 0.0), (0.0, 0.1), (0.0, -0.1)];

    /// Cell (0, 0): blob A around (9, 10), blob B around (13, 10) and one outlier.
    /// Cell (0, 1): two samples only.
    fn recorded_grid() -> RecordedGrid {
        let grid = Grid::new(vec![1, 2], 10.0).unwrap();
        let mut first = Vec::new();
        for (dx, dy) in BLOB_A {
            first.extend_from_slice(&[9.0 + dx, 10.0 + dy]);
        }
        for (dx, dy) in BLOB_B {
            first.extend_from_slice(&[13.0 + dx, 10.0 + dy]);
        }
        first.extend_from_slice(&[30.0, -30.0]);
        let samples = vec![
            DMatrix::from_column_slice(2, 11, &first),
            DMatrix::from_column_slice(2, 2, &[10.0, 20.0, 10.5, 20.5]),
        ];
        RecordedGrid::new(grid, samples).unwrap()
    }

    fn config() -> MixtureConfig {
        MixtureConfig {
            eps: 0.5,
            min_samples: 3,
            min_cluster_size: 3,
        }
    }

    #[test]
    fn test_fit_components() {
        let map = MixtureNoiseMap::from_source(&recorded_grid(), config()).unwrap();
        assert_eq!(map.num_components(), 2);
        assert_eq!(map.empty_cells(), 1);
        let components = map.components(&CellIndex::from(vec![0, 0])).unwrap();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].size(), 6);
        assert_approx_eq!(components[0].weight(), 0.6, 1e-12);
        assert_approx_eq!(components[1].weight(), 0.4, 1e-12);
        assert_approx_eq!(components[0].mean_offset()[0], -1.0, 1e-12);
        assert_approx_eq!(components[0].mean_offset()[1], 0.0, 1e-12);
        assert_approx_eq!(components[1].mean_offset()[0], 3.0, 1e-12);
        assert_approx_eq!(components[0].covariance()[(0, 1)], 0.004, 1e-12);
        assert!(map.components(&CellIndex::from(vec![0, 1])).unwrap().is_empty());
    }

    #[test]
    fn test_weights_sum_to_one() {
        let map = MixtureNoiseMap::from_source(&recorded_grid(), config()).unwrap();
        for cell in map.grid().cells() {
            let components = map.components(&cell).unwrap();
            if !components.is_empty() {
                let total: f64 = components.iter().map(|c| c.weight()).sum();
                assert_approx_eq!(total, 1.0, 1e-6);
            }
        }
    }

    #[test]
    fn test_small_clusters_are_dropped() {
        let cfg = MixtureConfig {
            min_cluster_size: 5,
            ..config()
        };
        let map = MixtureNoiseMap::from_source(&recorded_grid(), cfg).unwrap();
        let components = map.components(&CellIndex::from(vec![0, 0])).unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].weight(), 1.0);
    }

    #[test]
    fn test_mixture_likelihood() {
        let map = MixtureNoiseMap::from_source(&recorded_grid(), config()).unwrap();
        // particles in cell (0, 0), (0, 0) and (0, 1)
        let particles = DMatrix::from_column_slice(2, 3, &[10.0, 10.0, 10.0, 10.0, 10.0, 20.0]);
        let z = DMatrix::from_column_slice(2, 3, &[9.0, 10.0, 11.0, 10.0, 9.0, 20.0]);
        let p = map.conditioned_probability(&z, &particles).unwrap();
        assert_eq!(p.len(), 3);
        assert!(p[0] > p[1]);
        assert!(p[0] > 0.0);
        assert_eq!(p[2], 0.0);
        let log_p = map.log_conditioned_probability(&z, &particles).unwrap();
        assert_eq!(log_p[2], f64::NEG_INFINITY);
    }

    #[test]
    fn test_sample_from_mixture() {
        let map = MixtureNoiseMap::from_source(&recorded_grid(), config()).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let coordinates = DMatrix::from_element(2, 200, 10.0);
        let samples = map.sample_from(&coordinates, &mut rng).unwrap();
        assert_eq!(samples.shape(), (2, 200));
        let mut near_a = 0;
        for column in samples.column_iter() {
            let to_a = ((column[0] - 9.0).powi(2) + (column[1] - 10.0).powi(2)).sqrt();
            let to_b = ((column[0] - 13.0).powi(2) + (column[1] - 10.0).powi(2)).sqrt();
            assert!(to_a < 1.0 || to_b < 1.0);
            if to_a < 1.0 {
                near_a += 1;
            }
        }
        // component A carries weight 0.6
        assert!(near_a > 90 && near_a < 150);
    }

    #[test]
    fn test_sample_from_empty_cell() {
        let map = MixtureNoiseMap::from_source(&recorded_grid(), config()).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let coordinates = DMatrix::from_column_slice(2, 1, &[10.0, 20.0]);
        assert!(matches!(
            map.sample_from(&coordinates, &mut rng),
            Err(UwbError::MissingModel { .. })
        ));
    }

    #[test]
    fn test_unfitted_and_invalid() {
        let grid = Grid::new(vec![1, 2], 10.0).unwrap();
        let map = MixtureNoiseMap::new(grid.clone(), config()).unwrap();
        let z = DMatrix::zeros(2, 1);
        assert!(matches!(
            map.conditioned_probability(&z, &z),
            Err(UwbError::MissingModel { .. })
        ));
        let bad = MixtureConfig { eps: 0.0, ..config() };
        assert!(MixtureNoiseMap::new(grid.clone(), bad).is_err());
        let bad = MixtureConfig { min_cluster_size: 1, ..config() };
        assert!(MixtureNoiseMap::new(grid, bad).is_err());
    }
}
