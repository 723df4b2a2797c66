//! Tracking loop and result export.
//!
//! [`run_tracking`] wires a complete run from a [`UwbConfig`]: it generates the synthetic grid,
//! fits the noise map, spreads the initial particles over the grid and then alternates weight
//! updates and resampling over the measurement stream. Resampling is triggered when the
//! effective sample size falls below `effective_sample_threshold * M`.
//!
//! A batch that leaves every particle with zero likelihood does not abort the run: the loop logs
//! a warning, resets the weights to uniform and carries on with the next batch.

use std::path::Path;
use std::rc::Rc;

use log::{info, warn};
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use crate::builder::{
    build_dynamic_model, build_filter, build_generator, build_measurement_stream,
    build_noise_map,
};
use crate::config::{FilterKind, UwbConfig};
use crate::dynamics::DynamicModel;
use crate::error::{Result, UwbError};
use crate::noise_map::NoiseMap;
use crate::particle::ParticleFilter;
use crate::source::GridMeasurementSource;

/// Filter state after one measurement batch
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EstimateRecord {
    pub step: usize,
    /// Measurements in the batch
    pub measurements: usize,
    /// Effective sample size after the weight update, before any resampling
    pub effective_sample_size: f64,
    pub resampled: bool,
    /// The update failed with degenerate weights and the weights were reset
    pub degenerate: bool,
    pub estimate: Vec<f64>,
    /// Diagonal of the estimate covariance
    pub variance: Vec<f64>,
}

/// Run the complete pipeline described by `config`.
pub fn run_tracking(config: &UwbConfig) -> Result<Vec<EstimateRecord>> {
    config.validate()?;
    let generator = build_generator(&config.generator)?;
    let map: Option<Rc<dyn NoiseMap>> = match config.filter.kind {
        FilterKind::MapAugmented => Some(Rc::from(build_noise_map(&config.map, &generator)?)),
        FilterKind::Basic => None,
    };
    let mut filter = build_filter(&config.filter, generator.grid(), map)?;
    let dynamics = build_dynamic_model(config.dynamics.as_ref())?;
    let stream = build_measurement_stream(&config.measurements)?;
    track(
        &mut filter,
        dynamics.as_ref(),
        stream,
        config.filter.effective_sample_threshold,
        config.filter.seed.wrapping_add(1),
    )
}

/// Feed every batch of `stream` to `filter`.
///
/// # Arguments
/// - `filter` - filter to update in place
/// - `dynamics` - optional prediction step applied before each update. Particle velocities
///   start at zero and are kept per particle slot across resampling.
/// - `stream` - `d × k` measurement batches
/// - `threshold` - resample when the effective sample size is below `threshold * M`
/// - `seed` - seed for the prediction step noise
pub fn track<I>(
    filter: &mut ParticleFilter,
    dynamics: Option<&DynamicModel>,
    stream: I,
    threshold: f64,
    seed: u64,
) -> Result<Vec<EstimateRecord>>
where
    I: IntoIterator<Item = DMatrix<f64>>,
{
    let m = filter.num_particles();
    let mut velocities = DMatrix::zeros(filter.dimension(), m);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut records = Vec::new();
    for (step, z) in stream.into_iter().enumerate() {
        if let Some(model) = dynamics {
            let (particles, next_velocities) = model.step(filter.particles(), &velocities, &mut rng)?;
            filter.set_particles(particles)?;
            velocities = next_velocities;
        }
        let degenerate = match filter.update_weights(&z) {
            Ok(()) => false,
            Err(UwbError::DegenerateWeights { sum }) => {
                warn!("Step {step}: degenerate weights (normalizer {sum}), resetting to uniform");
                filter.reset_weights();
                true
            }
            Err(e) => return Err(e),
        };
        let effective_sample_size = filter.effective_sample_size();
        let resampled = effective_sample_size < threshold * m as f64;
        if resampled {
            filter.resample()?;
        }
        let estimate = filter.estimate();
        let variance = filter.certainty().diagonal();
        records.push(EstimateRecord {
            step,
            measurements: z.ncols(),
            effective_sample_size,
            resampled,
            degenerate,
            estimate: estimate.as_slice().to_vec(),
            variance: variance.as_slice().to_vec(),
        });
    }
    info!(
        "Tracked {} batches, resampled {} times",
        records.len(),
        records.iter().filter(|r| r.resampled).count()
    );
    Ok(records)
}

/// Write estimate records as CSV with one `x{k}`/`var{k}` column pair per dimension.
///
/// Rows are serialized from [`EstimateRecord`] with the vector fields flattened in place, so the
/// header is written up front from the dimension of the first record.
pub fn write_estimates_csv<P: AsRef<Path>>(records: &[EstimateRecord], path: P) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    let d = records.first().map_or(0, |r| r.estimate.len());
    let mut header: Vec<String> = vec![
        "step".into(),
        "measurements".into(),
        "effective_sample_size".into(),
        "resampled".into(),
        "degenerate".into(),
    ];
    header.extend((0..d).map(|k| format!("x{k}")));
    header.extend((0..d).map(|k| format!("var{k}")));
    writer.write_record(&header)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}
