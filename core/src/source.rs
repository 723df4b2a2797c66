//! Measurement sources consumed by the noise maps and the tracking loop.
//!
//! Two kinds of sources exist:
//! - **Grid sources** ([`GridMeasurementSource`]) traverse a measurement grid once per fitting
//!   cycle, yielding for every cell the raw measurement samples recorded there together with
//!   the cell index and anchor position. [`BlobGenerator`] synthesizes such a grid with one or
//!   more Gaussian blobs per cell to mimic multipath; [`RecordedGrid`] wraps samples recorded
//!   elsewhere.
//! - **Streaming sources** yield successive measurement batches (`d × k`, one measurement per
//!   column) and end when exhausted: [`FileMeasurements`] replays a CSV file and
//!   [`RandomMeasurements`] draws uniform points inside a box.

use std::fmt::{self, Debug};
use std::io;
use std::path::Path;

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::{Result, UwbError};
use crate::grid::{CellIndex, Grid};

/// Raw samples recorded in one grid cell
#[derive(Clone, Debug, PartialEq)]
pub struct CellRecord {
    /// `d × k` samples, one per column
    pub samples: DMatrix<f64>,
    pub cell: CellIndex,
    pub anchor: DVector<f64>,
}

/// A finite, single pass traversal of a measurement grid
pub trait GridMeasurementSource {
    /// The grid the records are indexed by. Also provides `closest_cell`.
    fn grid(&self) -> &Grid;
    /// Grid dimensions, used to pre-allocate per-cell storage
    fn shape(&self) -> &[usize] {
        self.grid().dims()
    }
    /// One record per cell
    fn records(&self) -> Box<dyn Iterator<Item = CellRecord> + '_>;
}

/// Synthetic grid of multi-modal measurements.
///
/// For every cell `c ~ U{modal_range}` blob centers are placed at `anchor + N(0, deviation²)`
/// per dimension and `samples_per_cell` measurements are spread across the centers as evenly
/// as possible (earlier centers receive the remainder). Each measurement is its center plus
/// `N(0, cluster_std²)` noise per dimension.
#[derive(Clone)]
pub struct BlobGenerator {
    grid: Grid,
    samples_per_cell: usize,
    modal_range: (usize, usize),
    deviation: f64,
    cluster_std: f64,
    rng: StdRng,
    data: Option<Vec<DMatrix<f64>>>,
}
impl Debug for BlobGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobGenerator")
            .field("grid", &self.grid.dims())
            .field("step", &self.grid.step())
            .field("samples_per_cell", &self.samples_per_cell)
            .field("modal_range", &self.modal_range)
            .field("deviation", &self.deviation)
            .field("cluster_std", &self.cluster_std)
            .field("generated", &self.data.is_some())
            .finish()
    }
}
impl BlobGenerator {
    /// Create a generator. No data is produced until [`BlobGenerator::generate`] is called.
    ///
    /// # Arguments
    /// - `grid_dims` - number of cells along each axis
    /// - `step` - anchor spacing
    /// - `samples_per_cell` - measurements simulated per cell
    /// - `modal_range` - inclusive range for the number of blobs per cell
    /// - `deviation` - standard deviation of blob centers around the anchor
    /// - `seed` - seed of the internal random number generator
    pub fn new(
        grid_dims: Vec<usize>,
        step: f64,
        samples_per_cell: usize,
        modal_range: (usize, usize),
        deviation: f64,
        seed: u64,
    ) -> Result<Self> {
        let grid = Grid::new(grid_dims, step)?;
        if samples_per_cell == 0 {
            return Err(UwbError::invalid("samples_per_cell", "must be at least 1"));
        }
        if modal_range.0 == 0 || modal_range.0 > modal_range.1 {
            return Err(UwbError::invalid(
                "modal_range",
                format!("expected 1 <= min <= max, got {modal_range:?}"),
            ));
        }
        if !(deviation.is_finite() && deviation >= 0.0) {
            return Err(UwbError::invalid("deviation", "must be finite and non-negative"));
        }
        Ok(BlobGenerator {
            grid,
            samples_per_cell,
            modal_range,
            deviation,
            cluster_std: 1.0,
            rng: StdRng::seed_from_u64(seed),
            data: None,
        })
    }
    /// Override the spread of the measurements around their blob center (default 1.0).
    pub fn with_cluster_std(mut self, cluster_std: f64) -> Result<Self> {
        if !(cluster_std.is_finite() && cluster_std > 0.0) {
            return Err(UwbError::invalid("cluster_std", "must be positive and finite"));
        }
        self.cluster_std = cluster_std;
        Ok(self)
    }
    pub fn is_generated(&self) -> bool {
        self.data.is_some()
    }
    pub fn samples_per_cell(&self) -> usize {
        self.samples_per_cell
    }
    /// Samples of one cell, if generated
    pub fn samples(&self, cell: &CellIndex) -> Option<&DMatrix<f64>> {
        let flat = self.grid.flat_index(cell).ok()?;
        self.data.as_ref().map(|data| &data[flat])
    }
    /// Simulate measurements for every cell, replacing any previous data.
    pub fn generate(&mut self) -> Result<()> {
        let d = self.grid.dimension();
        let center_noise = Normal::new(0.0, self.deviation)
            .map_err(|e| UwbError::invalid("deviation", e.to_string()))?;
        let sample_noise = Normal::new(0.0, self.cluster_std)
            .map_err(|e| UwbError::invalid("cluster_std", e.to_string()))?;
        let mut data = Vec::with_capacity(self.grid.num_cells());
        for cell in self.grid.cells() {
            let anchor = self.grid.anchor(&cell);
            let num_blobs = self
                .rng
                .random_range(self.modal_range.0..=self.modal_range.1);
            let centers: Vec<DVector<f64>> = (0..num_blobs)
                .map(|_| {
                    DVector::from_fn(d, |k, _| anchor[k] + center_noise.sample(&mut self.rng))
                })
                .collect();
            let mut samples = DMatrix::zeros(d, self.samples_per_cell);
            let per_blob = self.samples_per_cell / num_blobs;
            let remainder = self.samples_per_cell % num_blobs;
            let mut column = 0;
            for (b, center) in centers.iter().enumerate() {
                let count = per_blob + usize::from(b < remainder);
                for _ in 0..count {
                    for k in 0..d {
                        samples[(k, column)] = center[k] + sample_noise.sample(&mut self.rng);
                    }
                    column += 1;
                }
            }
            debug!("Generated {num_blobs} blobs for cell {cell}");
            data.push(samples);
        }
        info!(
            "Generated {} samples for each of {} cells",
            self.samples_per_cell,
            data.len()
        );
        self.data = Some(data);
        Ok(())
    }
}
impl GridMeasurementSource for BlobGenerator {
    fn grid(&self) -> &Grid {
        &self.grid
    }
    fn records(&self) -> Box<dyn Iterator<Item = CellRecord> + '_> {
        match &self.data {
            None => Box::new(std::iter::empty()),
            Some(data) => Box::new(data.iter().enumerate().map(|(flat, samples)| {
                let cell = self.grid.cell_at(flat);
                let anchor = self.grid.anchor(&cell);
                CellRecord {
                    samples: samples.clone(),
                    cell,
                    anchor,
                }
            })),
        }
    }
}

/// Grid source over pre-recorded samples, one `d × k` matrix per cell in row-major order.
#[derive(Clone, Debug)]
pub struct RecordedGrid {
    grid: Grid,
    samples: Vec<DMatrix<f64>>,
}
impl RecordedGrid {
    pub fn new(grid: Grid, samples: Vec<DMatrix<f64>>) -> Result<Self> {
        if samples.len() != grid.num_cells() {
            return Err(UwbError::shape("recorded cells", grid.num_cells(), samples.len()));
        }
        if let Some(bad) = samples.iter().find(|s| s.nrows() != grid.dimension()) {
            return Err(UwbError::shape(
                "recorded sample dimension",
                grid.dimension(),
                bad.nrows(),
            ));
        }
        Ok(RecordedGrid { grid, samples })
    }
}
impl GridMeasurementSource for RecordedGrid {
    fn grid(&self) -> &Grid {
        &self.grid
    }
    fn records(&self) -> Box<dyn Iterator<Item = CellRecord> + '_> {
        Box::new(self.samples.iter().enumerate().map(|(flat, samples)| {
            let cell = self.grid.cell_at(flat);
            let anchor = self.grid.anchor(&cell);
            CellRecord {
                samples: samples.clone(),
                cell,
                anchor,
            }
        }))
    }
}

/// Measurement batches replayed from a header-less CSV file with one measurement per row.
#[derive(Clone, Debug)]
pub struct FileMeasurements {
    measurements: DMatrix<f64>,
    batch_size: usize,
    position: usize,
}
impl FileMeasurements {
    /// Read all measurements from `path`.
    ///
    /// # Errors
    /// - `Io`/`Csv` if the file cannot be read or parsed
    /// - `ShapeMismatch` if rows have differing numbers of fields
    /// - `InvalidParameter` on a zero batch size or a non-numeric field
    pub fn open<P: AsRef<Path>>(path: P, batch_size: usize) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let measurements = Self::from_reader(file, batch_size)?;
        info!(
            "Loaded {} measurements from {}",
            measurements.measurements.ncols(),
            path.as_ref().display()
        );
        Ok(measurements)
    }
    /// Read all measurements from any reader of CSV text.
    pub fn from_reader<R: io::Read>(reader: R, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(UwbError::invalid("batch_size", "must be at least 1"));
        }
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut values: Vec<f64> = Vec::new();
        let mut dimension: Option<usize> = None;
        for (row, record) in csv_reader.records().enumerate() {
            let record = record?;
            match dimension {
                None => dimension = Some(record.len()),
                Some(d) if d != record.len() => {
                    return Err(UwbError::shape(
                        format!("fields in measurement row {row}"),
                        d,
                        record.len(),
                    ));
                }
                Some(_) => {}
            }
            for field in record.iter() {
                let value: f64 = field.parse().map_err(|_| {
                    UwbError::invalid("measurements", format!("row {row}: `{field}` is not a number"))
                })?;
                values.push(value);
            }
        }
        let d = dimension.unwrap_or(0);
        let n = if d == 0 { 0 } else { values.len() / d };
        Ok(FileMeasurements {
            measurements: DMatrix::from_vec(d, n, values),
            batch_size,
            position: 0,
        })
    }
    /// Dimension of a single measurement
    pub fn dimension(&self) -> usize {
        self.measurements.nrows()
    }
    pub fn len(&self) -> usize {
        self.measurements.ncols()
    }
    pub fn is_empty(&self) -> bool {
        self.measurements.ncols() == 0
    }
}
impl Iterator for FileMeasurements {
    type Item = DMatrix<f64>;
    fn next(&mut self) -> Option<Self::Item> {
        let total = self.measurements.ncols();
        if self.position >= total {
            return None;
        }
        let count = self.batch_size.min(total - self.position);
        let batch = self.measurements.columns(self.position, count).into_owned();
        self.position += count;
        Some(batch)
    }
}

/// Measurement batches drawn uniformly from the box `[low, high)`.
#[derive(Clone, Debug)]
pub struct RandomMeasurements {
    low: DVector<f64>,
    high: DVector<f64>,
    batch_size: usize,
    remaining: Option<usize>,
    rng: StdRng,
}
impl RandomMeasurements {
    /// # Arguments
    /// - `low`, `high` - per-dimension bounds, `low[k] < high[k]`
    /// - `batch_size` - measurements per batch
    /// - `num_batches` - number of batches before the stream ends, `None` for unbounded
    /// - `seed` - seed of the internal random number generator
    pub fn new(
        low: Vec<f64>,
        high: Vec<f64>,
        batch_size: usize,
        num_batches: Option<usize>,
        seed: u64,
    ) -> Result<Self> {
        if low.len() != high.len() {
            return Err(UwbError::shape("measurement bounds", low.len(), high.len()));
        }
        if low.is_empty() {
            return Err(UwbError::invalid("low", "bounds need at least one dimension"));
        }
        if low
            .iter()
            .zip(high.iter())
            .any(|(l, h)| !(l.is_finite() && h.is_finite() && l < h))
        {
            return Err(UwbError::invalid("high", "each upper bound must exceed its lower bound"));
        }
        if batch_size == 0 {
            return Err(UwbError::invalid("batch_size", "must be at least 1"));
        }
        Ok(RandomMeasurements {
            low: DVector::from_vec(low),
            high: DVector::from_vec(high),
            batch_size,
            remaining: num_batches,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}
impl Iterator for RandomMeasurements {
    type Item = DMatrix<f64>;
    fn next(&mut self) -> Option<Self::Item> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let d = self.low.len();
        let mut batch = DMatrix::zeros(d, self.batch_size);
        for j in 0..self.batch_size {
            for k in 0..d {
                batch[(k, j)] = self.rng.random_range(self.low[k]..self.high[k]);
            }
        }
        Some(batch)
    }
}
