//! Density based spatial clustering (DBSCAN) over the raw samples of one grid cell.
//!
//! A sample is a *core* sample when at least `min_samples` samples (itself included) lie within
//! Euclidean distance `eps`. Clusters are grown from core samples; samples reachable from a
//! core sample but not core themselves join the first cluster that reaches them, and samples
//! reachable from no core sample are labelled noise.

use std::collections::VecDeque;

use nalgebra::DMatrix;

use crate::error::{Result, UwbError};

/// Clustering parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Dbscan {
    eps: f64,
    min_samples: usize,
}

/// Cluster assignment of every sample of a fitted set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clustering {
    /// `None` marks a noise sample
    pub labels: Vec<Option<usize>>,
    pub num_clusters: usize,
}
impl Clustering {
    pub fn noise_count(&self) -> usize {
        self.labels.iter().filter(|l| l.is_none()).count()
    }
    /// Column indices of the samples assigned to `cluster`
    pub fn members(&self, cluster: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| (*l == Some(cluster)).then_some(i))
            .collect()
    }
}

impl Dbscan {
    /// # Errors
    /// - `InvalidParameter` unless `eps` is positive and finite and `min_samples >= 1`
    pub fn new(eps: f64, min_samples: usize) -> Result<Self> {
        if !(eps.is_finite() && eps > 0.0) {
            return Err(UwbError::invalid("eps", format!("must be positive, got {eps}")));
        }
        if min_samples == 0 {
            return Err(UwbError::invalid("min_samples", "must be at least 1"));
        }
        Ok(Dbscan { eps, min_samples })
    }
    pub fn eps(&self) -> f64 {
        self.eps
    }
    pub fn min_samples(&self) -> usize {
        self.min_samples
    }
    /// Cluster the columns of `samples`.
    pub fn fit(&self, samples: &DMatrix<f64>) -> Clustering {
        let n = samples.ncols();
        let eps_sq = self.eps * self.eps;
        let neighbours: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                (0..n)
                    .filter(|&j| (samples.column(i) - samples.column(j)).norm_squared() <= eps_sq)
                    .collect()
            })
            .collect();
        let is_core: Vec<bool> = neighbours
            .iter()
            .map(|nb| nb.len() >= self.min_samples)
            .collect();

        let mut labels: Vec<Option<usize>> = vec![None; n];
        let mut num_clusters = 0;
        for seed in 0..n {
            if labels[seed].is_some() || !is_core[seed] {
                continue;
            }
            let cluster = num_clusters;
            num_clusters += 1;
            labels[seed] = Some(cluster);
            let mut queue: VecDeque<usize> = VecDeque::from([seed]);
            while let Some(point) = queue.pop_front() {
                if !is_core[point] {
                    continue;
                }
                for &nb in &neighbours[point] {
                    if labels[nb].is_none() {
                        labels[nb] = Some(cluster);
                        queue.push_back(nb);
                    }
                }
            }
        }
        Clustering {
            labels,
            num_clusters,
        }
    }
}
