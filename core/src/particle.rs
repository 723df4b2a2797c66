//! Sequential Monte-Carlo position filter.
//!
//! One [`ParticleFilter`] type serves both measurement models through [`ParticleModel`]:
//!
//! - **Self-estimated** (basic): every particle is the mean of a Gaussian whose covariance is
//!   the sample covariance of the particle cloud. The covariance is re-estimated at construction
//!   and after every resample.
//! - **Noise map augmented** (MNMA): the likelihood of a measurement given a particle comes from
//!   a fitted [`NoiseMap`], which also supplies the jitter kernel on resampling.
//!
//! Particles are stored as a `d × M` matrix (one particle per column) with a parallel weight
//! vector. Measurement batches are treated as i.i.d.: the likelihood of a batch is the product of
//! the per-measurement likelihoods. Products are accumulated as sums of log densities and the
//! weights are normalized in log space, so long batches or distant particles do not underflow.
//!
//! Normalization has no epsilon guard. If no particle has a finite, positive likelihood the
//! update fails with [`UwbError::DegenerateWeights`] and the weights are left untouched.

use std::fmt::{self, Debug};
use std::rc::Rc;

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::diagnostics;
use crate::error::{Result, UwbError};
use crate::gaussian::{MultivariateNormal, sample_with_root};
use crate::linalg::{matrix_square_root, sample_covariance};
use crate::noise_map::NoiseMap;

/// How a point estimate and its spread are derived from the particle set
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleAveragingStrategy {
    #[default]
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}
impl ParticleAveragingStrategy {
    /// Mean and covariance of the particle set under this strategy
    pub fn average(
        &self,
        particles: &DMatrix<f64>,
        weights: &DVector<f64>,
    ) -> (DVector<f64>, DMatrix<f64>) {
        match self {
            ParticleAveragingStrategy::WeightedAverage => weighted_average_state(particles, weights),
            ParticleAveragingStrategy::UnweightedAverage => {
                let m = particles.ncols();
                let uniform = DVector::from_element(m, 1.0 / m as f64);
                weighted_average_state(particles, &uniform)
            }
            ParticleAveragingStrategy::HighestWeight => highest_weight_state(particles, weights),
        }
    }
}
fn weighted_average_state(
    particles: &DMatrix<f64>,
    weights: &DVector<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    let d = particles.nrows();
    let mean: DVector<f64> = particles * weights;
    let mut cov = DMatrix::<f64>::zeros(d, d);
    for (column, w) in particles.column_iter().zip(weights.iter()) {
        let diff = column - &mean;
        cov += *w * &diff * diff.transpose();
    }
    (mean, cov)
}
fn highest_weight_state(
    particles: &DMatrix<f64>,
    weights: &DVector<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    let d = particles.nrows();
    let best = weights.imax();
    (particles.column(best).into_owned(), DMatrix::zeros(d, d))
}

/// How source particles are selected when resampling.
///
/// Every strategy maps uniform draws through the inclusive cumulative weights, whose last entry
/// is forced to exactly 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleResamplingStrategy {
    /// `M` independent uniform draws
    #[default]
    Multinomial,
    /// One uniform offset shared by `M` evenly spaced positions
    Systematic,
    /// One uniform draw inside each of `M` equal strata
    Stratified,
    /// Deterministic `floor(M w)` copies, remainder drawn from the residual weights
    Residual,
}
impl ParticleResamplingStrategy {
    /// Select `weights.len()` source indices. `weights` must be normalized.
    pub fn select<R: Rng + ?Sized>(&self, weights: &DVector<f64>, rng: &mut R) -> Vec<usize> {
        let m = weights.len();
        match self {
            ParticleResamplingStrategy::Multinomial => {
                let positions: Vec<f64> = (0..m).map(|_| rng.random::<f64>()).collect();
                select_by_positions(weights.as_slice(), &positions)
            }
            ParticleResamplingStrategy::Systematic => {
                let u0: f64 = rng.random();
                let positions: Vec<f64> = (0..m).map(|i| (i as f64 + u0) / m as f64).collect();
                select_by_positions(weights.as_slice(), &positions)
            }
            ParticleResamplingStrategy::Stratified => {
                let positions: Vec<f64> = (0..m)
                    .map(|i| (i as f64 + rng.random::<f64>()) / m as f64)
                    .collect();
                select_by_positions(weights.as_slice(), &positions)
            }
            ParticleResamplingStrategy::Residual => residual_indices(weights.as_slice(), rng),
        }
    }
}

/// Inclusive cumulative sum with the final entry forced to 1
fn cumulative_weights(weights: &[f64]) -> Vec<f64> {
    let mut acc = 0.0;
    let mut cumulative: Vec<f64> = weights
        .iter()
        .map(|w| {
            acc += w;
            acc
        })
        .collect();
    if let Some(last) = cumulative.last_mut() {
        *last = 1.0;
    }
    cumulative
}

/// Map each position in `[0, 1)` to the first index whose cumulative weight exceeds it.
fn select_by_positions(weights: &[f64], positions: &[f64]) -> Vec<usize> {
    let cumulative = cumulative_weights(weights);
    let last = cumulative.len().saturating_sub(1);
    positions
        .iter()
        .map(|&u| cumulative.partition_point(|&c| c <= u).min(last))
        .collect()
}

fn residual_indices<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let m = weights.len();
    let mut indices = Vec::with_capacity(m);
    let mut residual = vec![0.0; m];
    for (i, &w) in weights.iter().enumerate() {
        let scaled = w * m as f64;
        let copies = scaled.floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies));
        residual[i] = scaled - copies as f64;
    }
    indices.truncate(m);
    let remaining = m - indices.len();
    let total: f64 = residual.iter().sum();
    if remaining > 0 && total > 0.0 {
        let normalized: Vec<f64> = residual.iter().map(|r| r / total).collect();
        let positions: Vec<f64> = (0..remaining).map(|_| rng.random::<f64>()).collect();
        indices.extend(select_by_positions(&normalized, &positions));
    } else if remaining > 0 {
        // rounding left no residual mass; fill from the heaviest particle
        let best = weights
            .iter()
            .enumerate()
            .fold(0, |best, (i, w)| if *w > weights[best] { i } else { best });
        indices.extend(std::iter::repeat_n(best, remaining));
    }
    indices
}

/// Measurement model of a [`ParticleFilter`]
#[derive(Clone, Debug)]
pub enum ParticleModel {
    /// Gaussian around each particle with the cloud's own sample covariance
    SelfEstimated { data_covariance: DMatrix<f64> },
    /// Likelihoods and resampling jitter from a fitted noise map
    NoiseMap(Rc<dyn NoiseMap>),
}

/// Tuning shared by both filter variants
#[derive(Clone, Debug)]
pub struct FilterConfig {
    pub resampling_strategy: ParticleResamplingStrategy,
    pub averaging_strategy: ParticleAveragingStrategy,
    pub seed: u64,
}
impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            resampling_strategy: ParticleResamplingStrategy::Multinomial,
            averaging_strategy: ParticleAveragingStrategy::WeightedAverage,
            seed: 42,
        }
    }
}

#[derive(Clone)]
pub struct ParticleFilter {
    particles: DMatrix<f64>,
    weights: DVector<f64>,
    model: ParticleModel,
    config: FilterConfig,
    rng: StdRng,
}
impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self.weights.iter().copied().fold(f64::INFINITY, f64::min);
        let max_weight = self.weights.iter().copied().fold(0.0, f64::max);
        let variant = match self.model {
            ParticleModel::SelfEstimated { .. } => "basic",
            ParticleModel::NoiseMap(_) => "map-augmented",
        };
        f.debug_struct("ParticleFilter")
            .field("variant", &variant)
            .field("num_particles", &self.particles.ncols())
            .field("dimension", &self.particles.nrows())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field("mean", &self.estimate().as_slice())
            .finish()
    }
}
impl ParticleFilter {
    /// Create a filter whose likelihood is a Gaussian around each particle with the particle
    /// cloud's sample covariance.
    ///
    /// # Arguments
    /// - `particles` - `d × M` initial particles, `M >= 2`
    /// - `weights` - `M` non-negative initial weights, normalized on construction
    /// - `config` - resampling/averaging strategies and the random seed
    ///
    /// # Errors
    /// - `SingularCovariance` if the particles lie in a lower dimensional subspace, which is
    ///   always the case for `M <= d`
    pub fn basic(
        particles: DMatrix<f64>,
        weights: DVector<f64>,
        config: FilterConfig,
    ) -> Result<Self> {
        let weights = validate_initial_state(&particles, weights)?;
        if particles.ncols() < 2 {
            return Err(UwbError::invalid(
                "particles",
                "the basic filter estimates a covariance and needs at least 2 particles",
            ));
        }
        let data_covariance = sample_covariance(&particles)?;
        // particles that do not span every axis leave the likelihood undefined
        MultivariateNormal::new(DVector::zeros(particles.nrows()), data_covariance.clone())?;
        info!(
            "Created basic particle filter with {} particles in {} dimensions",
            particles.ncols(),
            particles.nrows()
        );
        Ok(ParticleFilter {
            particles,
            weights,
            model: ParticleModel::SelfEstimated { data_covariance },
            rng: StdRng::seed_from_u64(config.seed),
            config,
        })
    }
    /// Create a filter that takes likelihoods and resampling jitter from `map`.
    ///
    /// # Arguments
    /// - `particles` - `d × M` initial particles, `d` matching the map's grid
    /// - `weights` - `M` non-negative initial weights, normalized on construction
    /// - `map` - noise map, typically already fitted
    /// - `config` - resampling/averaging strategies and the random seed
    pub fn map_augmented(
        particles: DMatrix<f64>,
        weights: DVector<f64>,
        map: Rc<dyn NoiseMap>,
        config: FilterConfig,
    ) -> Result<Self> {
        let weights = validate_initial_state(&particles, weights)?;
        let d = map.grid().dimension();
        if particles.nrows() != d {
            return Err(UwbError::shape("particle dimension", d, particles.nrows()));
        }
        info!(
            "Created map-augmented particle filter with {} particles in {} dimensions",
            particles.ncols(),
            d
        );
        Ok(ParticleFilter {
            particles,
            weights,
            model: ParticleModel::NoiseMap(map),
            rng: StdRng::seed_from_u64(config.seed),
            config,
        })
    }
    /// `d × M` particle positions
    pub fn particles(&self) -> &DMatrix<f64> {
        &self.particles
    }
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }
    pub fn model(&self) -> &ParticleModel {
        &self.model
    }
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
    pub fn num_particles(&self) -> usize {
        self.particles.ncols()
    }
    pub fn dimension(&self) -> usize {
        self.particles.nrows()
    }
    /// Covariance used by the basic variant, `None` for the map-augmented variant
    pub fn data_covariance(&self) -> Option<&DMatrix<f64>> {
        match &self.model {
            ParticleModel::SelfEstimated { data_covariance } => Some(data_covariance),
            ParticleModel::NoiseMap(_) => None,
        }
    }
    /// Replace the particle positions, e.g. after a prediction step. The particle count and
    /// dimension must not change; weights are kept.
    pub fn set_particles(&mut self, particles: DMatrix<f64>) -> Result<()> {
        if particles.nrows() != self.particles.nrows() {
            return Err(UwbError::shape(
                "particle dimension",
                self.particles.nrows(),
                particles.nrows(),
            ));
        }
        if particles.ncols() != self.particles.ncols() {
            return Err(UwbError::shape(
                "particle count",
                self.particles.ncols(),
                particles.ncols(),
            ));
        }
        self.particles = particles;
        Ok(())
    }
    /// Reset every weight to `1/M`.
    pub fn reset_weights(&mut self) {
        let m = self.weights.len();
        self.weights = DVector::from_element(m, 1.0 / m as f64);
    }
    /// Multiply every weight by the likelihood of the measurement batch `z` (`d × K`) and
    /// renormalize.
    ///
    /// # Errors
    /// - `ShapeMismatch` if the measurement dimension differs from the particle dimension
    /// - `DegenerateWeights` if every updated weight is zero or any is not finite; the weights
    ///   are left unchanged
    /// - any error from the noise map query (e.g. `MissingModel`)
    pub fn update_weights(&mut self, z: &DMatrix<f64>) -> Result<()> {
        if z.nrows() != self.particles.nrows() {
            return Err(UwbError::shape(
                "measurement dimension",
                self.particles.nrows(),
                z.nrows(),
            ));
        }
        let log_likelihood = match &self.model {
            ParticleModel::SelfEstimated { data_covariance } => {
                self_estimated_log_likelihood(&self.particles, data_covariance, z)?
            }
            ParticleModel::NoiseMap(map) => map_log_likelihood(map.as_ref(), &self.particles, z)?,
        };
        let log_weights = self.weights.map(f64::ln) + log_likelihood;
        self.weights = normalize_log_weights(&log_weights)?;
        debug!(
            "Updated weights from {} measurements, effective sample size {:.2}",
            z.ncols(),
            self.effective_sample_size()
        );
        Ok(())
    }
    /// Draw a new particle set according to the weights, jitter it with the model's kernel and
    /// reset the weights to `1/M`.
    pub fn resample(&mut self) -> Result<()> {
        let indices = self
            .config
            .resampling_strategy
            .select(&self.weights, &mut self.rng);
        let selected = self.particles.select_columns(indices.iter());
        let (particles, model) = match &self.model {
            ParticleModel::SelfEstimated { data_covariance } => {
                let root = matrix_square_root(data_covariance);
                let mut jittered = selected;
                for mut column in jittered.column_iter_mut() {
                    let center = column.clone_owned();
                    column.copy_from(&sample_with_root(&center, &root, &mut self.rng));
                }
                let data_covariance = sample_covariance(&jittered)?;
                (jittered, ParticleModel::SelfEstimated { data_covariance })
            }
            ParticleModel::NoiseMap(map) => {
                let jittered = map.sample_from(&selected, &mut self.rng)?;
                (jittered, ParticleModel::NoiseMap(Rc::clone(map)))
            }
        };
        self.particles = particles;
        self.model = model;
        self.reset_weights();
        info!(
            "Resampled {} particles ({:?})",
            self.particles.ncols(),
            self.config.resampling_strategy
        );
        Ok(())
    }
    pub fn effective_sample_size(&self) -> f64 {
        diagnostics::effective_sample_size(&self.weights)
    }
    /// Point estimate under the configured averaging strategy
    pub fn estimate(&self) -> DVector<f64> {
        self.config
            .averaging_strategy
            .average(&self.particles, &self.weights)
            .0
    }
    /// Spread of the estimate under the configured averaging strategy
    pub fn certainty(&self) -> DMatrix<f64> {
        self.config
            .averaging_strategy
            .average(&self.particles, &self.weights)
            .1
    }
}

fn validate_initial_state(particles: &DMatrix<f64>, weights: DVector<f64>) -> Result<DVector<f64>> {
    if particles.ncols() == 0 || particles.nrows() == 0 {
        return Err(UwbError::invalid("particles", "need at least one particle of dimension >= 1"));
    }
    if weights.len() != particles.ncols() {
        return Err(UwbError::shape("initial weights", particles.ncols(), weights.len()));
    }
    if particles.iter().any(|v| !v.is_finite()) {
        return Err(UwbError::invalid("particles", "positions must be finite"));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(UwbError::invalid("weights", "weights must be finite and non-negative"));
    }
    let sum = weights.sum();
    if sum <= 0.0 {
        return Err(UwbError::DegenerateWeights { sum });
    }
    Ok(weights / sum)
}

/// `Σ_k ln N(z_k; p_j, C)` for every particle `p_j`
fn self_estimated_log_likelihood(
    particles: &DMatrix<f64>,
    data_covariance: &DMatrix<f64>,
    z: &DMatrix<f64>,
) -> Result<DVector<f64>> {
    let d = particles.nrows();
    let kernel = MultivariateNormal::new(DVector::zeros(d), data_covariance.clone())?;
    let mut log_likelihood = DVector::zeros(particles.ncols());
    for (j, particle) in particles.column_iter().enumerate() {
        let mut total = 0.0;
        for measurement in z.column_iter() {
            total += kernel.log_pdf(&(measurement - particle))?;
        }
        log_likelihood[j] = total;
    }
    Ok(log_likelihood)
}

/// `Σ_k ln p(z_k | p_j)` for every particle, evaluated with one batched map query over all
/// `M·K` particle/measurement pairs.
fn map_log_likelihood(
    map: &dyn NoiseMap,
    particles: &DMatrix<f64>,
    z: &DMatrix<f64>,
) -> Result<DVector<f64>> {
    let m = particles.ncols();
    let k = z.ncols();
    if k == 0 {
        return Ok(DVector::zeros(m));
    }
    let d = particles.nrows();
    let mut repeated_z = DMatrix::zeros(d, m * k);
    let mut repeated_particles = DMatrix::zeros(d, m * k);
    for j in 0..m {
        for i in 0..k {
            repeated_z.set_column(j * k + i, &z.column(i));
            repeated_particles.set_column(j * k + i, &particles.column(j));
        }
    }
    let pair_log_probabilities = map.log_conditioned_probability(&repeated_z, &repeated_particles)?;
    Ok(DVector::from_fn(m, |j, _| {
        pair_log_probabilities.rows(j * k, k).sum()
    }))
}

/// Exponentiate and normalize log weights after subtracting their maximum.
fn normalize_log_weights(log_weights: &DVector<f64>) -> Result<DVector<f64>> {
    let max = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return Err(UwbError::DegenerateWeights { sum: 0.0 });
    }
    if log_weights.iter().any(|l| l.is_nan()) || !max.is_finite() {
        return Err(UwbError::DegenerateWeights { sum: f64::NAN });
    }
    let weights = log_weights.map(|l| (l - max).exp());
    let sum = weights.sum();
    if !(sum.is_finite() && sum > 0.0) {
        return Err(UwbError::DegenerateWeights { sum });
    }
    Ok(weights / sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    use crate::grid::Grid;
    use crate::noise_map::{GaussianNoiseMap, MixtureConfig, MixtureNoiseMap};
    use crate::source::RecordedGrid;

    /// Ten particles `(j, (j + 1)², (j + 5)³)`
    fn scenario_particles() -> DMatrix<f64> {
        DMatrix::from_fn(3, 10, |r, j| {
            let j = j as f64;
            match r {
                0 => j,
                1 => (j + 1.0).powi(2),
                _ => (j + 5.0).powi(3),
            }
        })
    }

    fn scenario_measurements() -> DMatrix<f64> {
        DMatrix::from_column_slice(3, 2, &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0])
    }

    fn uniform(m: usize) -> DVector<f64> {
        DVector::from_element(m, 1.0 / m as f64)
    }

    /// 2x2 grid, step 10, each cell with unit-variance-like samples centered on its anchor
    fn fitted_map() -> Rc<dyn NoiseMap> {
        let grid = Grid::new(vec![2, 2], 10.0).unwrap();
        let samples = grid
            .cells()
            .map(|cell| {
                let a = grid.anchor(&cell);
                DMatrix::from_column_slice(
                    2,
                    4,
                    &[a[0] + 1.0, a[1], a[0] - 1.0, a[1], a[0], a[1] + 1.0, a[0], a[1] - 1.0],
                )
            })
            .collect();
        let source = RecordedGrid::new(grid, samples).unwrap();
        Rc::new(GaussianNoiseMap::from_source(&source).unwrap())
    }

    #[test]
    fn test_basic_update_then_resample_scenario() {
        let mut pf =
            ParticleFilter::basic(scenario_particles(), uniform(10), FilterConfig::default())
                .unwrap();
        pf.update_weights(&scenario_measurements()).unwrap();
        assert_approx_eq!(pf.weights().sum(), 1.0, 1e-3);
        pf.resample().unwrap();
        assert_eq!(pf.num_particles(), 10);
        assert_eq!(pf.particles().shape(), (3, 10));
        assert!(pf.weights().iter().all(|w| *w == 0.1));
    }

    #[test]
    fn test_basic_update_prefers_close_particles() {
        let particles = DMatrix::from_column_slice(1, 3, &[0.0, 5.0, 10.0]);
        let mut pf = ParticleFilter::basic(particles, uniform(3), FilterConfig::default()).unwrap();
        pf.update_weights(&DMatrix::from_column_slice(1, 2, &[0.5, -0.5]))
            .unwrap();
        let w = pf.weights();
        assert!(w[0] > w[1] && w[1] > w[2]);
        assert_approx_eq!(w.sum(), 1.0, 1e-12);
    }

    #[test]
    fn test_basic_covariance_recomputed_after_resample() {
        let mut pf =
            ParticleFilter::basic(scenario_particles(), uniform(10), FilterConfig::default())
                .unwrap();
        let before = pf.data_covariance().unwrap().clone();
        assert_eq!(before, sample_covariance(&scenario_particles()).unwrap());
        pf.resample().unwrap();
        let after = pf.data_covariance().unwrap();
        assert_eq!(*after, sample_covariance(pf.particles()).unwrap());
    }

    #[test]
    fn test_map_augmented_scenario() {
        let particles = DMatrix::from_column_slice(
            2,
            4,
            &[10.0, 10.0, 10.0, 20.0, 20.0, 10.0, 20.0, 20.0],
        );
        let mut pf =
            ParticleFilter::map_augmented(particles, uniform(4), fitted_map(), FilterConfig::default())
                .unwrap();
        let z = DMatrix::from_column_slice(2, 2, &[19.5, 10.5, 20.5, 9.5]);
        pf.update_weights(&z).unwrap();
        let w = pf.weights().clone();
        assert_approx_eq!(w.sum(), 1.0, 1e-3);
        // the particle at (20, 10) explains both measurements best
        assert_eq!(w.imax(), 2);
        pf.resample().unwrap();
        assert_eq!(pf.num_particles(), 4);
        assert!(pf.weights().iter().all(|v| *v == 0.25));
    }

    /// 2x2 grid, step 10, each cell with a direct blob at `anchor + (0.5, 0)` and a reflected
    /// blob at `anchor + (4, 4)`
    fn fitted_mixture_map() -> Rc<dyn NoiseMap> {
        let grid = Grid::new(vec![2, 2], 10.0).unwrap();
        let blob = [(0.0, 0.0), (0.5, 0.0), (-0.5, 0.0), (0.0, 0.5), (0.0, -0.5)];
        let samples = grid
            .cells()
            .map(|cell| {
                let a = grid.anchor(&cell);
                let mut values = Vec::new();
                for (cx, cy) in [(0.5, 0.0), (4.0, 4.0)] {
                    for (dx, dy) in blob {
                        values.extend_from_slice(&[a[0] + cx + dx, a[1] + cy + dy]);
                    }
                }
                DMatrix::from_column_slice(2, 10, &values)
            })
            .collect();
        let source = RecordedGrid::new(grid, samples).unwrap();
        let config = MixtureConfig {
            eps: 1.5,
            min_samples: 4,
            min_cluster_size: 3,
        };
        Rc::new(MixtureNoiseMap::from_source(&source, config).unwrap())
    }

    #[test]
    fn test_map_augmented_mixture_scenario() {
        // ten particles cycling over the four cells
        let particles = DMatrix::from_fn(2, 10, |r, j| {
            let cell = j % 4;
            let index = if r == 0 { cell % 2 } else { cell / 2 };
            10.0 + 10.0 * index as f64 + 0.1 * j as f64
        });
        let mut pf = ParticleFilter::map_augmented(
            particles,
            uniform(10),
            fitted_mixture_map(),
            FilterConfig::default(),
        )
        .unwrap();
        // one direct and one reflected measurement of a receiver in cell (1, 0)
        let z = DMatrix::from_column_slice(2, 2, &[20.5, 10.0, 24.0, 14.0]);
        pf.update_weights(&z).unwrap();
        assert_approx_eq!(pf.weights().sum(), 1.0, 1e-12);
        assert_eq!(pf.weights().imax() % 4, 1);

        pf.resample().unwrap();
        assert_eq!(pf.num_particles(), 10);
        assert_eq!(pf.particles().shape(), (2, 10));
        assert!(pf.weights().iter().all(|w| *w == 0.1));
        // new particles are drawn from the mixture of cell (1, 0)
        let anchor = DVector::from_vec(vec![20.0, 10.0]);
        for column in pf.particles().column_iter() {
            assert!((column - &anchor).norm() < 8.0);
        }
    }

    #[test]
    fn test_map_augmented_batch_product() {
        // one measurement twice equals the square of the single measurement likelihood
        let particles = DMatrix::from_column_slice(2, 2, &[10.0, 10.0, 20.0, 20.0]);
        let map = fitted_map();
        let z = DMatrix::from_column_slice(2, 1, &[11.0, 10.0]);
        let twice = DMatrix::from_column_slice(2, 2, &[11.0, 10.0, 11.0, 10.0]);
        let single = map_log_likelihood(map.as_ref(), &particles, &z).unwrap();
        let double = map_log_likelihood(map.as_ref(), &particles, &twice).unwrap();
        assert_approx_eq!(double[0], 2.0 * single[0], 1e-9);
        assert_approx_eq!(double[1], 2.0 * single[1], 1e-9);
    }

    #[test]
    fn test_degenerate_weights_leave_state_untouched() {
        let particles = DMatrix::from_column_slice(1, 2, &[0.0, 1.0]);
        let mut pf = ParticleFilter::basic(particles, uniform(2), FilterConfig::default()).unwrap();
        let log_weights = DVector::from_vec(vec![f64::NEG_INFINITY, f64::NEG_INFINITY]);
        assert!(matches!(
            normalize_log_weights(&log_weights),
            Err(UwbError::DegenerateWeights { .. })
        ));
        // an infinitely distant measurement has zero likelihood under every particle
        let z = DMatrix::from_column_slice(1, 1, &[f64::INFINITY]);
        let before = pf.weights().clone();
        assert!(pf.update_weights(&z).is_err());
        assert_eq!(pf.weights(), &before);
    }

    #[test]
    fn test_construction_validation() {
        let particles = DMatrix::zeros(2, 3);
        assert!(ParticleFilter::basic(particles.clone(), uniform(2), FilterConfig::default()).is_err());
        assert!(
            ParticleFilter::basic(particles.clone(), DVector::zeros(3), FilterConfig::default())
                .is_err()
        );
        assert!(ParticleFilter::basic(DMatrix::zeros(2, 1), uniform(1), FilterConfig::default())
            .is_err());
        assert!(
            ParticleFilter::map_augmented(DMatrix::zeros(3, 3), uniform(3), fitted_map(), FilterConfig::default())
                .is_err()
        );
        let pf = ParticleFilter::map_augmented(
            particles,
            DVector::from_vec(vec![2.0, 1.0, 1.0]),
            fitted_map(),
            FilterConfig::default(),
        )
        .unwrap();
        assert_eq!(pf.weights().as_slice(), &[0.5, 0.25, 0.25]);
    }

    #[test]
    fn test_basic_rejects_singular_particle_cloud() {
        // as many particles as dimensions
        let too_few = DMatrix::from_column_slice(3, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        assert!(matches!(
            ParticleFilter::basic(too_few, uniform(3), FilterConfig::default()),
            Err(UwbError::SingularCovariance { .. })
        ));
        // collinear particles
        let collinear = DMatrix::from_fn(2, 5, |r, j| (j as f64) * (r as f64 + 1.0));
        assert!(matches!(
            ParticleFilter::basic(collinear, uniform(5), FilterConfig::default()),
            Err(UwbError::SingularCovariance { .. })
        ));
        // one axis shared by every particle
        let flat = DMatrix::from_fn(3, 10, |r, j| if r == 0 { 10.0 } else { (j * (r + 2) % 7) as f64 });
        assert!(matches!(
            ParticleFilter::basic(flat, uniform(10), FilterConfig::default()),
            Err(UwbError::SingularCovariance { .. })
        ));
    }

    #[test]
    fn test_measurement_dimension_mismatch() {
        let mut pf =
            ParticleFilter::basic(scenario_particles(), uniform(10), FilterConfig::default())
                .unwrap();
        assert!(matches!(
            pf.update_weights(&DMatrix::zeros(2, 1)),
            Err(UwbError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_selection_strategies() {
        let weights = DVector::from_vec(vec![0.0, 0.5, 0.0, 0.5]);
        let mut rng = StdRng::seed_from_u64(1);
        for strategy in [
            ParticleResamplingStrategy::Multinomial,
            ParticleResamplingStrategy::Systematic,
            ParticleResamplingStrategy::Stratified,
            ParticleResamplingStrategy::Residual,
        ] {
            let indices = strategy.select(&weights, &mut rng);
            assert_eq!(indices.len(), 4);
            assert!(indices.iter().all(|&i| i == 1 || i == 3), "{strategy:?}");
        }
        // evenly spaced positions hit each half twice
        let mut indices = ParticleResamplingStrategy::Systematic.select(&weights, &mut rng);
        indices.sort();
        assert_eq!(indices, vec![1, 1, 3, 3]);
    }

    #[test]
    fn test_cumulative_weights_last_entry_is_one() {
        let cumulative = cumulative_weights(&[0.3, 0.3, 0.3999999]);
        assert_eq!(*cumulative.last().unwrap(), 1.0);
        assert_eq!(select_by_positions(&[0.3, 0.3, 0.3999999], &[0.9999999999]), vec![2]);
    }

    #[test]
    fn test_averaging_strategies() {
        let particles = DMatrix::from_column_slice(1, 3, &[0.0, 1.0, 2.0]);
        let weights = DVector::from_vec(vec![0.25, 0.25, 0.5]);
        let (mean, cov) = ParticleAveragingStrategy::WeightedAverage.average(&particles, &weights);
        assert_approx_eq!(mean[0], 1.25, 1e-12);
        assert_approx_eq!(cov[(0, 0)], 0.25 * 1.5625 + 0.25 * 0.0625 + 0.5 * 0.5625, 1e-12);
        let (mean, _) = ParticleAveragingStrategy::UnweightedAverage.average(&particles, &weights);
        assert_approx_eq!(mean[0], 1.0, 1e-12);
        let (mean, cov) = ParticleAveragingStrategy::HighestWeight.average(&particles, &weights);
        assert_eq!(mean[0], 2.0);
        assert_eq!(cov[(0, 0)], 0.0);
    }
}
