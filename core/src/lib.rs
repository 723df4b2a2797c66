//! Particle filtering with empirically learned measurement noise maps
//!
//! This crate provides the tools for localizing a receiver (for example an ultra-wideband tag) with a particle filter
//! whose measurement model is learned from data. Rather than assuming a single global Gaussian measurement error, the
//! space of interest is discretized into a regular grid and a noise model is fitted to the measurements observed in
//! every cell. The particle filter then scores each particle against the incoming measurements using the model of the
//! cell the particle falls in, and draws new particles from those same models when it resamples.
//!
//! All points are stored column-wise in `nalgebra` matrices: a batch of `N` points in `d` dimensions is a `d × N`
//! [`DMatrix<f64>`](nalgebra::DMatrix). Likelihoods are carried in natural-log space internally and only exponentiated
//! when a caller asks for plain probabilities, so products over many measurements do not underflow.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra for the filters and noise models.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides random number generation for synthetic data, resampling and jitter.
//! - [`serde`](https://crates.io/crates/serde): Provides the configuration file formats (JSON, YAML and TOML).
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [grid]: Contains the axis-aligned measurement grid and nearest-cell lookup.
//! - [source]: Contains the measurement sources: a synthetic grid generator, recorded grids and measurement streams.
//! - [noise_map]: Contains the per-cell noise models (single Gaussian and Gaussian mixture) behind a common trait.
//! - [particle]: Contains the basic and noise-map-augmented particle filters and their resampling strategies.
//! - [diagnostics]: Contains weight degeneracy diagnostics.
//! - [dynamics]: Contains a constant velocity motion model for the prediction step.
//! - [gaussian]: Contains the multivariate normal density used by the noise maps.
//! - [linalg]: Contains linear algebra utilities and helper functions.
//! - [config]: Contains the serializable run configuration.
//! - [builder]: Contains constructors turning configuration sections into pipeline components.
//! - [sim]: Contains the tracking loop and result export.
//!
//! ## Noise maps
//!
//! A noise map answers two questions for a measurement `z` and a particle at position `x`: how likely is `z` if the
//! receiver is really at `x`, and what would a measurement taken at `x` look like. Both are answered by locating the
//! grid cell closest to `x` and consulting the model fitted for that cell. Models are fitted on the measurement offsets
//! `z - anchor`, where the anchor is the nominal position of the cell, so the same model serves every particle in the
//! cell.
//!
//! ## Example
//!
//! ```
//! use uwb::grid::{CellIndex, Grid};
//!
//! let grid = Grid::new(vec![2, 4, 6], 10.0).unwrap();
//! assert_eq!(grid.num_cells(), 48);
//! let cell = grid.closest_cell_of(&nalgebra::DVector::from_vec(vec![14.0, 26.0, 200.0])).unwrap();
//! assert_eq!(cell, CellIndex::new(vec![0, 2, 5]));
//! ```

pub mod builder;
pub mod config;
pub mod diagnostics;
pub mod dynamics;
pub mod error;
pub mod gaussian;
pub mod grid;
pub mod linalg;
pub mod noise_map;
pub mod particle;
pub mod sim;
pub mod source;

pub use error::{Result, UwbError};
pub use grid::{CellIndex, Grid};
pub use noise_map::{GaussianNoiseMap, MixtureNoiseMap, NoiseMap};
pub use particle::{ParticleFilter, ParticleModel};
pub use source::{BlobGenerator, GridMeasurementSource};
