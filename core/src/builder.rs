//! Construction of pipeline components from their configuration sections.

use std::rc::Rc;

use log::info;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{
    DynamicsConfig, FilterKind, FilterSettings, GeneratorConfig, MapConfig, MeasurementConfig,
};
use crate::dynamics::DynamicModel;
use crate::error::{Result, UwbError};
use crate::grid::Grid;
use crate::noise_map::{GaussianNoiseMap, MixtureNoiseMap, NoiseMap};
use crate::particle::ParticleFilter;
use crate::source::{BlobGenerator, FileMeasurements, GridMeasurementSource, RandomMeasurements};

/// Boxed stream of `d × k` measurement batches
pub type MeasurementStream = Box<dyn Iterator<Item = DMatrix<f64>>>;

/// Create the synthetic grid source and generate its data.
pub fn build_generator(cfg: &GeneratorConfig) -> Result<BlobGenerator> {
    let mut generator = BlobGenerator::new(
        cfg.grid_dims.clone(),
        cfg.step_size,
        cfg.samples_per_cell,
        cfg.modal_range,
        cfg.deviation,
        cfg.seed,
    )?
    .with_cluster_std(cfg.cluster_std)?;
    generator.generate()?;
    Ok(generator)
}

/// Create the configured noise map and fit it on `source`.
pub fn build_noise_map(
    cfg: &MapConfig,
    source: &dyn GridMeasurementSource,
) -> Result<Box<dyn NoiseMap>> {
    let map: Box<dyn NoiseMap> = match cfg.mixture_config() {
        None => Box::new(GaussianNoiseMap::from_source(source)?),
        Some(mixture) => Box::new(MixtureNoiseMap::from_source(source, mixture)?),
    };
    Ok(map)
}

/// `num_particles` positions drawn uniformly over the anchor bounding box of `grid`, with
/// uniform weights.
pub fn initial_particles<R: Rng + ?Sized>(
    grid: &Grid,
    num_particles: usize,
    rng: &mut R,
) -> (DMatrix<f64>, DVector<f64>) {
    let (lower, upper) = grid.bounds();
    let particles = DMatrix::from_fn(grid.dimension(), num_particles, |k, _| {
        lower[k] + (upper[k] - lower[k]) * rng.random::<f64>()
    });
    let weights = DVector::from_element(num_particles, 1.0 / num_particles as f64);
    (particles, weights)
}

/// Seed of the initial particle draw.
///
/// Offset from the filter seed so the initial positions and the first resample do not consume
/// the same random stream.
pub fn initial_particle_seed(filter_seed: u64) -> u64 {
    filter_seed.wrapping_add(2)
}

/// Create the configured particle filter with particles spread over `grid`.
///
/// The map-augmented variant requires `map`; the basic variant ignores it.
pub fn build_filter(
    settings: &FilterSettings,
    grid: &Grid,
    map: Option<Rc<dyn NoiseMap>>,
) -> Result<ParticleFilter> {
    let mut rng = StdRng::seed_from_u64(initial_particle_seed(settings.seed));
    let (particles, weights) = initial_particles(grid, settings.num_particles, &mut rng);
    info!(
        "Initialized {} particles uniformly over {}",
        settings.num_particles, grid
    );
    match settings.kind {
        FilterKind::Basic => ParticleFilter::basic(particles, weights, settings.filter_config()),
        FilterKind::MapAugmented => {
            let map = map.ok_or_else(|| UwbError::MissingModel {
                context: "the map-augmented filter needs a noise map".to_string(),
            })?;
            ParticleFilter::map_augmented(particles, weights, map, settings.filter_config())
        }
    }
}

/// Create the optional prediction step.
pub fn build_dynamic_model(cfg: Option<&DynamicsConfig>) -> Result<Option<DynamicModel>> {
    cfg.map(|c| DynamicModel::new(c.std)).transpose()
}

/// Open the configured measurement stream.
pub fn build_measurement_stream(cfg: &MeasurementConfig) -> Result<MeasurementStream> {
    let stream: MeasurementStream = match cfg {
        MeasurementConfig::File { path, batch_size } => {
            Box::new(FileMeasurements::open(path, *batch_size)?)
        }
        MeasurementConfig::Random {
            low,
            high,
            batch_size,
            num_batches,
            seed,
        } => Box::new(RandomMeasurements::new(
            low.clone(),
            high.clone(),
            *batch_size,
            *num_batches,
            *seed,
        )?),
    };
    Ok(stream)
}
