//! Run configuration for the tracking pipeline.
//!
//! A [`UwbConfig`] bundles one section per pipeline component: the synthetic grid generator, the
//! noise map, the particle filter, the optional dynamic model and the measurement stream. It can
//! be stored as JSON, YAML or TOML; the format is chosen from the file extension.
//!
//! ```
//! use uwb::config::{MapConfig, UwbConfig};
//!
//! let mut cfg = UwbConfig::default();
//! cfg.map = MapConfig::GaussianMixture { eps: 1.5, min_samples: 4, min_cluster_size: 3 };
//! assert!(cfg.validate().is_ok());
//! ```

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, UwbError};
use crate::noise_map::MixtureConfig;
use crate::particle::{FilterConfig, ParticleAveragingStrategy, ParticleResamplingStrategy};

fn default_seed() -> u64 {
    42
}
fn default_cluster_std() -> f64 {
    1.0
}

/// Synthetic multi-modal grid generator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Cells along each axis
    pub grid_dims: Vec<usize>,
    /// Anchor spacing
    pub step_size: f64,
    pub samples_per_cell: usize,
    /// Inclusive bounds for the number of blobs per cell
    pub modal_range: (usize, usize),
    /// Spread of blob centers around the anchor
    pub deviation: f64,
    /// Spread of samples around their blob center
    #[serde(default = "default_cluster_std")]
    pub cluster_std: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}
impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            grid_dims: vec![2, 4, 6],
            step_size: 10.0,
            samples_per_cell: 100,
            modal_range: (1, 3),
            deviation: 1.0,
            cluster_std: default_cluster_std(),
            seed: default_seed(),
        }
    }
}
impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.grid_dims.is_empty() || self.grid_dims.contains(&0) {
            return Err(UwbError::Config(
                "generator.grid_dims must be non-empty with every axis >= 1".to_string(),
            ));
        }
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(UwbError::Config("generator.step_size must be positive".to_string()));
        }
        if self.samples_per_cell == 0 {
            return Err(UwbError::Config("generator.samples_per_cell must be >= 1".to_string()));
        }
        let (low, high) = self.modal_range;
        if low == 0 || low > high {
            return Err(UwbError::Config(format!(
                "generator.modal_range must satisfy 1 <= min <= max, got ({low}, {high})"
            )));
        }
        if !(self.deviation.is_finite() && self.deviation >= 0.0) {
            return Err(UwbError::Config("generator.deviation must be >= 0".to_string()));
        }
        if !(self.cluster_std.is_finite() && self.cluster_std > 0.0) {
            return Err(UwbError::Config("generator.cluster_std must be positive".to_string()));
        }
        Ok(())
    }
}

/// Noise map variant and its parameters
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MapConfig {
    /// One Gaussian per cell
    #[default]
    Normal,
    /// Gaussian mixture per cell from density based clustering
    GaussianMixture {
        eps: f64,
        min_samples: usize,
        min_cluster_size: usize,
    },
}
impl MapConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            MapConfig::Normal => Ok(()),
            MapConfig::GaussianMixture { .. } => self
                .mixture_config()
                .map_or(Ok(()), |cfg| cfg.validate())
                .map_err(|e| UwbError::Config(format!("map: {e}"))),
        }
    }
    /// Clustering parameters of the mixture variant
    pub fn mixture_config(&self) -> Option<MixtureConfig> {
        match self {
            MapConfig::Normal => None,
            MapConfig::GaussianMixture {
                eps,
                min_samples,
                min_cluster_size,
            } => Some(MixtureConfig {
                eps: *eps,
                min_samples: *min_samples,
                min_cluster_size: *min_cluster_size,
            }),
        }
    }
}

/// Particle filter variant
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// Self-estimated Gaussian likelihood
    Basic,
    /// Likelihood and resampling jitter from the noise map
    #[default]
    MapAugmented,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default)]
    pub kind: FilterKind,
    pub num_particles: usize,
    #[serde(default)]
    pub resampling_strategy: ParticleResamplingStrategy,
    #[serde(default)]
    pub averaging_strategy: ParticleAveragingStrategy,
    /// Resample when the effective sample size drops below this fraction of the particle count
    pub effective_sample_threshold: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}
impl Default for FilterSettings {
    fn default() -> Self {
        FilterSettings {
            kind: FilterKind::default(),
            num_particles: 500,
            resampling_strategy: ParticleResamplingStrategy::default(),
            averaging_strategy: ParticleAveragingStrategy::default(),
            effective_sample_threshold: 0.5,
            seed: default_seed(),
        }
    }
}
impl FilterSettings {
    pub fn validate(&self) -> Result<()> {
        let min_particles = match self.kind {
            FilterKind::Basic => 2,
            FilterKind::MapAugmented => 1,
        };
        if self.num_particles < min_particles {
            return Err(UwbError::Config(format!(
                "filter.num_particles must be >= {min_particles} for the {:?} filter",
                self.kind
            )));
        }
        let t = self.effective_sample_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(UwbError::Config(format!(
                "filter.effective_sample_threshold must be in (0, 1], got {t}"
            )));
        }
        Ok(())
    }
    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig {
            resampling_strategy: self.resampling_strategy,
            averaging_strategy: self.averaging_strategy,
            seed: self.seed,
        }
    }
}

/// Constant velocity prediction step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DynamicsConfig {
    /// Standard deviation of the per-step velocity perturbation
    pub std: f64,
}
impl Default for DynamicsConfig {
    fn default() -> Self {
        DynamicsConfig { std: 1.0 }
    }
}
impl DynamicsConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.std.is_finite() && self.std >= 0.0) {
            return Err(UwbError::Config("dynamics.std must be >= 0".to_string()));
        }
        Ok(())
    }
}

/// Source of the measurement batches fed to the filter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasurementConfig {
    /// Header-less CSV, one measurement per row
    File { path: PathBuf, batch_size: usize },
    /// Uniform points inside `[low, high)`
    Random {
        low: Vec<f64>,
        high: Vec<f64>,
        batch_size: usize,
        num_batches: Option<usize>,
        #[serde(default = "default_seed")]
        seed: u64,
    },
}
impl Default for MeasurementConfig {
    fn default() -> Self {
        MeasurementConfig::Random {
            low: vec![10.0, 10.0, 10.0],
            high: vec![20.0, 40.0, 60.0],
            batch_size: 2,
            num_batches: Some(50),
            seed: 7,
        }
    }
}
impl MeasurementConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            MeasurementConfig::File { batch_size, .. } => {
                if *batch_size == 0 {
                    return Err(UwbError::Config("measurements.batch_size must be >= 1".to_string()));
                }
            }
            MeasurementConfig::Random {
                low,
                high,
                batch_size,
                ..
            } => {
                if *batch_size == 0 {
                    return Err(UwbError::Config("measurements.batch_size must be >= 1".to_string()));
                }
                if low.is_empty() || low.len() != high.len() {
                    return Err(UwbError::Config(
                        "measurements.low and measurements.high must have the same non-zero length"
                            .to_string(),
                    ));
                }
                if low.iter().zip(high.iter()).any(|(l, h)| !(l < h)) {
                    return Err(UwbError::Config(
                        "measurements.low must be below measurements.high in every dimension"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Complete configuration of a tracking run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UwbConfig {
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub filter: FilterSettings,
    #[serde(default)]
    pub dynamics: Option<DynamicsConfig>,
    #[serde(default)]
    pub measurements: MeasurementConfig,
}
impl UwbConfig {
    /// Validate every section and their mutual consistency.
    pub fn validate(&self) -> Result<()> {
        self.generator.validate()?;
        self.map.validate()?;
        self.filter.validate()?;
        if let Some(dynamics) = &self.dynamics {
            dynamics.validate()?;
        }
        self.measurements.validate()?;
        if self.filter.kind == FilterKind::Basic {
            // initial particles must span every axis for a nonsingular sample covariance
            let d = self.generator.grid_dims.len();
            if self.filter.num_particles <= d {
                return Err(UwbError::Config(format!(
                    "filter.num_particles must exceed the grid dimension ({d}) for the Basic filter"
                )));
            }
            if self.generator.grid_dims.contains(&1) {
                return Err(UwbError::Config(
                    "the Basic filter needs at least two cells along every grid axis".to_string(),
                ));
            }
        }
        if let MeasurementConfig::Random { low, .. } = &self.measurements {
            if low.len() != self.generator.grid_dims.len() {
                return Err(UwbError::Config(format!(
                    "random measurements have {} dimensions but the grid has {}",
                    low.len(),
                    self.generator.grid_dims.len()
                )));
            }
        }
        Ok(())
    }
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(|e| UwbError::Config(e.to_string()))
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|e| UwbError::Config(e.to_string()))
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(|e| UwbError::Config(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(|e| UwbError::Config(e.to_string()))
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(|e| UwbError::Config(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(|e| UwbError::Config(e.to_string()))
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(UwbError::Config(format!(
                "unsupported config file extension: {}",
                p.display()
            ))),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(UwbError::Config(format!(
                "unsupported config file extension: {}",
                p.display()
            ))),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_cfg() -> UwbConfig {
        UwbConfig {
            map: MapConfig::GaussianMixture {
                eps: 1.5,
                min_samples: 4,
                min_cluster_size: 3,
            },
            filter: FilterSettings {
                kind: FilterKind::Basic,
                num_particles: 200,
                resampling_strategy: ParticleResamplingStrategy::Systematic,
                ..FilterSettings::default()
            },
            dynamics: Some(DynamicsConfig { std: 0.5 }),
            ..UwbConfig::default()
        }
    }

    #[test]
    fn test_default_is_valid() {
        assert!(UwbConfig::default().validate().is_ok());
        assert!(sample_cfg().validate().is_ok());
    }

    #[test]
    fn json_roundtrip() {
        let cfg = sample_cfg();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        cfg.to_json(&path).unwrap();
        assert_eq!(UwbConfig::from_json(&path).unwrap(), cfg);
    }

    #[test]
    fn yaml_roundtrip() {
        let cfg = sample_cfg();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        cfg.to_yaml(&path).unwrap();
        assert_eq!(UwbConfig::from_yaml(&path).unwrap(), cfg);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = sample_cfg();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        cfg.to_toml(&path).unwrap();
        assert_eq!(UwbConfig::from_toml(&path).unwrap(), cfg);
    }

    #[test]
    fn generic_dispatch() {
        let cfg = UwbConfig::default();
        let dir = TempDir::new().unwrap();
        for name in ["a.json", "b.yml", "c.toml"] {
            let path = dir.path().join(name);
            cfg.to_file(&path).unwrap();
            assert_eq!(UwbConfig::from_file(&path).unwrap(), cfg);
        }
        assert!(matches!(
            cfg.to_file(dir.path().join("d.txt")),
            Err(UwbError::Config(_))
        ));
    }

    #[test]
    fn missing_sections_take_defaults() {
        let cfg: UwbConfig = serde_json::from_str(r#"{"map": {"kind": "normal"}}"#).unwrap();
        assert_eq!(cfg, UwbConfig::default());
        let cfg: UwbConfig = serde_yaml::from_str(
            "map:\n  kind: gaussian_mixture\n  eps: 2.0\n  min_samples: 5\n  min_cluster_size: 4\n",
        )
        .unwrap();
        assert_eq!(
            cfg.map.mixture_config(),
            Some(MixtureConfig {
                eps: 2.0,
                min_samples: 5,
                min_cluster_size: 4
            })
        );
    }

    #[test]
    fn invalid_sections() {
        let mut cfg = UwbConfig::default();
        cfg.generator.modal_range = (3, 1);
        assert!(cfg.validate().is_err());

        let mut cfg = UwbConfig::default();
        cfg.map = MapConfig::GaussianMixture {
            eps: -1.0,
            min_samples: 4,
            min_cluster_size: 3,
        };
        assert!(cfg.validate().is_err());

        let mut cfg = UwbConfig::default();
        cfg.filter.effective_sample_threshold = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = UwbConfig::default();
        cfg.filter.kind = FilterKind::Basic;
        cfg.filter.num_particles = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = UwbConfig::default();
        cfg.measurements = MeasurementConfig::Random {
            low: vec![0.0, 0.0],
            high: vec![1.0, 1.0],
            batch_size: 1,
            num_batches: None,
            seed: 1,
        };
        assert!(matches!(cfg.validate(), Err(UwbError::Config(_))));
    }

    #[test]
    fn basic_filter_needs_a_spanning_particle_cloud() {
        let mut cfg = UwbConfig::default();
        cfg.filter.kind = FilterKind::Basic;
        cfg.filter.num_particles = 3;
        assert!(matches!(cfg.validate(), Err(UwbError::Config(_))));
        cfg.filter.num_particles = 4;
        assert!(cfg.validate().is_ok());

        cfg.generator.grid_dims = vec![1, 4, 6];
        cfg.filter.num_particles = 100;
        assert!(matches!(cfg.validate(), Err(UwbError::Config(_))));

        // the map-augmented filter does not estimate a covariance from its particles
        cfg.filter.kind = FilterKind::MapAugmented;
        assert!(cfg.validate().is_ok());
    }
}
