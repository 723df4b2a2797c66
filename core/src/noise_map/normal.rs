//! Single Gaussian noise map.
//!
//! Every cell holds the mean offset of its samples from the cell anchor and their sample
//! covariance. Queries evaluate `z - anchor` against `N(mean_offset, covariance)` of the closest
//! cell of the paired particle.

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::RngCore;

use crate::error::{Result, UwbError};
use crate::gaussian::{MultivariateNormal, sample_with_root};
use crate::grid::{CellIndex, Grid};
use crate::linalg::{matrix_square_root, sample_covariance, sample_mean};
use crate::noise_map::{NoiseMap, Traversal, check_pairs, check_source};
use crate::source::GridMeasurementSource;

/// Minimum samples per cell needed for a covariance estimate
pub const MIN_CELL_SAMPLES: usize = 2;

/// Per-cell single Gaussian measurement model
#[derive(Clone, Debug)]
pub struct GaussianNoiseMap {
    grid: Grid,
    means: Vec<DVector<f64>>,
    covariances: Vec<DMatrix<f64>>,
    // `None` where the covariance cannot be factored for density evaluation
    densities: Vec<Option<MultivariateNormal>>,
    roots: Vec<DMatrix<f64>>,
    fitted: bool,
}
impl GaussianNoiseMap {
    /// Pre-allocate zeroed parameters for every cell of `grid`.
    pub fn new(grid: Grid) -> Self {
        let n = grid.num_cells();
        let d = grid.dimension();
        GaussianNoiseMap {
            means: vec![DVector::zeros(d); n],
            covariances: vec![DMatrix::zeros(d, d); n],
            densities: vec![None; n],
            roots: vec![DMatrix::zeros(d, d); n],
            fitted: false,
            grid,
        }
    }
    /// Allocate a map matching the grid of `source` and fit it.
    pub fn from_source(source: &dyn GridMeasurementSource) -> Result<Self> {
        let mut map = GaussianNoiseMap::new(source.grid().clone());
        map.fit(source)?;
        Ok(map)
    }
    /// Shape of the mean parameters, `grid_dims + [d]`
    pub fn means_shape(&self) -> Vec<usize> {
        let mut shape = self.grid.dims().to_vec();
        shape.push(self.grid.dimension());
        shape
    }
    /// Shape of the covariance parameters, `grid_dims + [d, d]`
    pub fn covariances_shape(&self) -> Vec<usize> {
        let mut shape = self.means_shape();
        shape.push(self.grid.dimension());
        shape
    }
    /// Mean offset from the anchor of `cell`
    pub fn mean_offset(&self, cell: &CellIndex) -> Result<&DVector<f64>> {
        Ok(&self.means[self.grid.flat_index(cell)?])
    }
    pub fn covariance(&self, cell: &CellIndex) -> Result<&DMatrix<f64>> {
        Ok(&self.covariances[self.grid.flat_index(cell)?])
    }
    fn require_fitted(&self) -> Result<()> {
        if !self.fitted {
            return Err(UwbError::MissingModel {
                context: "gaussian noise map has not been fitted".to_string(),
            });
        }
        Ok(())
    }
}

impl NoiseMap for GaussianNoiseMap {
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
        let mut means = vec![DVector::zeros(d); n];
        let mut covariances = vec![DMatrix::zeros(d, d); n];
        let mut densities = vec![None; n];
        let mut roots = vec![DMatrix::zeros(d, d); n];
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
            let k = record.samples.ncols();
            if k < MIN_CELL_SAMPLES {
                return Err(UwbError::InsufficientData {
                    cell: record.cell,
                    samples: k,
                    required: MIN_CELL_SAMPLES,
                });
            }
            let mean = sample_mean(&record.samples)? - &record.anchor;
            let covariance = sample_covariance(&record.samples)?;
            match MultivariateNormal::new(mean.clone(), covariance.clone()) {
                Ok(density) => densities[flat] = Some(density),
                Err(e) => warn!("Cell {} has no usable density: {e}", record.cell),
            }
            roots[flat] = matrix_square_root(&covariance);
            debug!(
                "Cell {}: {k} samples, mean offset {:?}",
                record.cell,
                mean.as_slice()
            );
            means[flat] = mean;
            covariances[flat] = covariance;
        }
        traversal.finish()?;
        self.means = means;
        self.covariances = covariances;
        self.densities = densities;
        self.roots = roots;
        self.fitted = true;
        info!("Fitted gaussian noise map over {}", self.grid);
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
        for (j, cell) in cells.iter().enumerate() {
            let flat = self.grid.flat_index(cell)?;
            let density =
                self.densities[flat]
                    .as_ref()
                    .ok_or_else(|| UwbError::SingularCovariance {
                        context: format!("cell {cell}"),
                    })?;
            let offset = z.column(j) - anchors.column(j);
            log_probabilities[j] = density.log_pdf(&offset)?;
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
            let flat = self.grid.flat_index(cell)?;
            let offset = sample_with_root(&self.means[flat], &self.roots[flat], rng);
            let absolute = samples.column(j) + offset;
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

    use crate::source::{CellRecord, RecordedGrid};

    /// Four samples per cell around `anchor + (0.5, -0.5)`
    fn cross_samples(anchor: &DVector<f64>) -> DMatrix<f64> {
        let offsets = [(1.0, 0.0), (-1.0, 0.0), (0.0, 1.0), (0.0, -1.0)];
        let mut samples = DMatrix::zeros(2, offsets.len());
        for (j, (dx, dy)) in offsets.iter().enumerate() {
            samples[(0, j)] = anchor[0] + 0.5 + dx;
            samples[(1, j)] = anchor[1] - 0.5 + dy;
        }
        samples
    }

    fn recorded_grid() -> RecordedGrid {
        let grid = Grid::new(vec![2, 3], 10.0).unwrap();
        let samples = grid
            .cells()
            .map(|cell| cross_samples(&grid.anchor(&cell)))
            .collect();
        RecordedGrid::new(grid, samples).unwrap()
    }

    #[test]
    fn test_fit_parameters() {
        let map = GaussianNoiseMap::from_source(&recorded_grid()).unwrap();
        assert!(map.is_fitted());
        assert_eq!(map.means_shape(), vec![2, 3, 2]);
        assert_eq!(map.covariances_shape(), vec![2, 3, 2, 2]);
        let cell = CellIndex::from(vec![1, 2]);
        let mean = map.mean_offset(&cell).unwrap();
        assert_approx_eq!(mean[0], 0.5, 1e-12);
        assert_approx_eq!(mean[1], -0.5, 1e-12);
        let cov = map.covariance(&cell).unwrap();
        assert_approx_eq!(cov[(0, 0)], 2.0 / 3.0, 1e-12);
        assert_approx_eq!(cov[(1, 1)], 2.0 / 3.0, 1e-12);
        assert_approx_eq!(cov[(0, 1)], 0.0, 1e-12);
    }

    #[test]
    fn test_probability_batch_lengths() {
        let map = GaussianNoiseMap::from_source(&recorded_grid()).unwrap();
        let z = DMatrix::from_column_slice(2, 1, &[10.0, 10.0]);
        let particles = DMatrix::from_column_slice(2, 1, &[11.0, 9.0]);
        assert_eq!(map.conditioned_probability(&z, &particles).unwrap().len(), 1);
        let z = DMatrix::from_column_slice(2, 2, &[10.0, 10.0, 20.0, 30.0]);
        let particles = DMatrix::from_column_slice(2, 2, &[11.0, 9.0, 19.0, 31.0]);
        let p = map.conditioned_probability(&z, &particles).unwrap();
        assert_eq!(p.len(), 2);
        assert!(p.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn test_density_peaks_at_learned_mean() {
        let map = GaussianNoiseMap::from_source(&recorded_grid()).unwrap();
        let particles = DMatrix::from_column_slice(2, 2, &[20.0, 20.0, 20.0, 20.0]);
        // first measurement at anchor + mean offset, second five standard deviations away
        let z = DMatrix::from_column_slice(2, 2, &[20.5, 19.5, 24.6, 19.5]);
        let p = map.conditioned_probability(&z, &particles).unwrap();
        assert!(p[0] > p[1]);
        let expected = 1.0 / (2.0 * std::f64::consts::PI * (2.0 / 3.0));
        assert_approx_eq!(p[0], expected, 1e-12);
    }

    #[test]
    fn test_unfitted_map_is_missing_model() {
        let map = GaussianNoiseMap::new(Grid::new(vec![2, 2], 1.0).unwrap());
        let z = DMatrix::zeros(2, 1);
        assert!(matches!(
            map.conditioned_probability(&z, &z),
            Err(UwbError::MissingModel { .. })
        ));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            map.sample_from(&z, &mut rng),
            Err(UwbError::MissingModel { .. })
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let map = GaussianNoiseMap::from_source(&recorded_grid()).unwrap();
        let z = DMatrix::zeros(2, 2);
        let particles = DMatrix::zeros(2, 3);
        assert!(matches!(
            map.conditioned_probability(&z, &particles),
            Err(UwbError::ShapeMismatch { .. })
        ));
        assert!(map.conditioned_probability(&DMatrix::zeros(3, 1), &DMatrix::zeros(3, 1)).is_err());
    }

    #[test]
    fn test_insufficient_data() {
        let grid = Grid::new(vec![2], 1.0).unwrap();
        let samples = vec![
            DMatrix::from_column_slice(1, 3, &[1.0, 1.5, 0.5]),
            DMatrix::from_column_slice(1, 1, &[2.0]),
        ];
        let source = RecordedGrid::new(grid.clone(), samples).unwrap();
        let mut map = GaussianNoiseMap::new(grid);
        match map.fit(&source) {
            Err(UwbError::InsufficientData { cell, samples, required }) => {
                assert_eq!(cell, CellIndex::from(vec![1]));
                assert_eq!(samples, 1);
                assert_eq!(required, 2);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(!map.is_fitted());
    }

    #[test]
    fn test_fit_rejects_source_with_other_spacing() {
        let source = recorded_grid();
        let mut map = GaussianNoiseMap::new(Grid::new(vec![2, 3], 5.0).unwrap());
        assert!(matches!(map.fit(&source), Err(UwbError::InvalidParameter { .. })));
        assert!(!map.is_fitted());
        let mut map = GaussianNoiseMap::new(Grid::new(vec![3, 2], 10.0).unwrap());
        assert!(matches!(map.fit(&source), Err(UwbError::ShapeMismatch { .. })));
    }

    /// Source that stops after its first cell
    struct TruncatedSource(RecordedGrid);
    impl GridMeasurementSource for TruncatedSource {
        fn grid(&self) -> &Grid {
            self.0.grid()
        }
        fn records(&self) -> Box<dyn Iterator<Item = CellRecord> + '_> {
            Box::new(self.0.records().take(1))
        }
    }

    #[test]
    fn test_incomplete_traversal() {
        let source = TruncatedSource(recorded_grid());
        let mut map = GaussianNoiseMap::new(source.grid().clone());
        assert!(matches!(
            map.fit(&source),
            Err(UwbError::IncompleteTraversal { visited: 1, expected: 6 })
        ));
    }

    #[test]
    fn test_singular_cell_is_reported_on_query() {
        let grid = Grid::new(vec![1, 1], 1.0).unwrap();
        // samples on a line: rank deficient covariance
        let samples = vec![DMatrix::from_column_slice(2, 3, &[0.0, 0.0, 1.0, 1.0, 2.0, 2.0])];
        let source = RecordedGrid::new(grid, samples).unwrap();
        let map = GaussianNoiseMap::from_source(&source).unwrap();
        let z = DMatrix::from_column_slice(2, 1, &[1.0, 1.0]);
        assert!(matches!(
            map.conditioned_probability(&z, &z),
            Err(UwbError::SingularCovariance { .. })
        ));
        let mut rng = StdRng::seed_from_u64(1);
        let drawn = map.sample_from(&z, &mut rng).unwrap();
        assert!(drawn.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_sample_from_returns_absolute_positions() {
        let map = GaussianNoiseMap::from_source(&recorded_grid()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let coordinates = DMatrix::from_column_slice(2, 3, &[10.0, 10.0, 21.0, 29.0, 0.0, 100.0]);
        let samples = map.sample_from(&coordinates, &mut rng).unwrap();
        assert_eq!(samples.shape(), (2, 3));
        let anchors = [(10.0, 10.0), (20.0, 30.0), (10.0, 30.0)];
        for (j, (ax, ay)) in anchors.iter().enumerate() {
            assert!((samples[(0, j)] - ax).abs() < 6.0);
            assert!((samples[(1, j)] - ay).abs() < 6.0);
        }
    }
}
