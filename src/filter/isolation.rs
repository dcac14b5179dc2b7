//! Isolation forest outlier detector.
//!
//! Each tree recursively partitions a random subsample with random
//! axis-aligned splits; anomalous points are isolated in fewer splits. The
//! score of a point is `2^(-E[h(x)] / c(ψ))` where `h` is the path length and
//! `c(ψ)` the average path length of an unsuccessful BST search over `ψ`
//! points. Scores near 1 are anomalous, scores well below 0.5 are normal.

use crate::error::{OpsError, Result};
use nalgebra::DMatrix;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Configuration for isolation forest fitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForestConfig {
    /// Number of trees in the ensemble.
    pub n_trees: usize,
    /// Subsample size per tree (capped at the number of rows).
    pub max_samples: usize,
    /// Random seed; tree `t` uses `seed + t`.
    pub seed: u64,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_samples: 256,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn fit(data: &DMatrix<f64>, rows: Vec<usize>, max_depth: usize, rng: &mut ChaCha20Rng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(data, rows, 0, max_depth, rng);
        tree
    }

    fn grow(
        &mut self,
        data: &DMatrix<f64>,
        rows: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut ChaCha20Rng,
    ) -> usize {
        let idx = self.nodes.len();
        if depth >= max_depth || rows.len() <= 1 {
            self.nodes.push(Node::Leaf { size: rows.len() });
            return idx;
        }

        // Features that still vary within this node
        let candidates: Vec<(usize, f64, f64)> = (0..data.ncols())
            .filter_map(|j| {
                let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                    let v = data[(i, j)];
                    (lo.min(v), hi.max(v))
                });
                (lo < hi).then_some((j, lo, hi))
            })
            .collect();
        if candidates.is_empty() {
            self.nodes.push(Node::Leaf { size: rows.len() });
            return idx;
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        // Convex combination stays finite even when hi - lo overflows
        let u: f64 = rng.gen();
        let threshold = lo * (1.0 - u) + hi * u;
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&i| data[(i, feature)] < threshold);

        // Reserve this slot, children fill in after it
        self.nodes.push(Node::Leaf { size: 0 });
        let left = self.grow(data, left_rows, depth + 1, max_depth, rng);
        let right = self.grow(data, right_rows, depth + 1, max_depth, rng);
        self.nodes[idx] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        idx
    }

    fn path_length(&self, point: &[f64]) -> f64 {
        let mut idx = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if point[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Average path length of an unsuccessful search in a binary search tree of `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// A fitted isolation forest.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    sample_size: usize,
    n_features: usize,
}

impl IsolationForest {
    /// Fit on the rows of `data` (cells × features). Every value must be finite.
    pub fn fit(data: &DMatrix<f64>, config: &IsolationForestConfig) -> Result<Self> {
        let n = data.nrows();
        if n < 2 {
            return Err(OpsError::EmptyData(
                "isolation forest needs at least two rows".to_string(),
            ));
        }
        if config.n_trees == 0 || config.max_samples < 2 {
            return Err(OpsError::config(
                "isolation_forest",
                format!(
                    "n_trees = {}, max_samples = {}",
                    config.n_trees, config.max_samples
                ),
            ));
        }
        if let Some(j) = (0..data.ncols()).find(|&j| data.column(j).iter().any(|v| !v.is_finite())) {
            return Err(OpsError::AlignmentPrecondition(format!(
                "outlier detection input column {} holds missing or infinite values",
                j
            )));
        }

        let sample_size = config.max_samples.min(n);
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let trees = (0..config.n_trees)
            .into_par_iter()
            .map(|t| {
                let mut rng = ChaCha20Rng::seed_from_u64(config.seed.wrapping_add(t as u64));
                let rows = sample(&mut rng, n, sample_size).into_vec();
                IsolationTree::fit(data, rows, max_depth, &mut rng)
            })
            .collect();

        Ok(Self {
            trees,
            sample_size,
            n_features: data.ncols(),
        })
    }

    /// Anomaly score for each row of `data`; higher is more anomalous.
    pub fn score_samples(&self, data: &DMatrix<f64>) -> Result<Vec<f64>> {
        if data.ncols() != self.n_features {
            return Err(OpsError::DimensionMismatch {
                expected: self.n_features,
                actual: data.ncols(),
            });
        }
        let norm = average_path_length(self.sample_size);
        let n_trees = self.trees.len() as f64;
        Ok((0..data.nrows())
            .into_par_iter()
            .map(|i| {
                let point: Vec<f64> = data.row(i).iter().copied().collect();
                let mean_path =
                    self.trees.iter().map(|t| t.path_length(&point)).sum::<f64>() / n_trees;
                2f64.powf(-mean_path / norm)
            })
            .collect())
    }
}

/// Flag the `floor(contamination × n)` highest-scoring rows.
///
/// Ties are broken by row order, so the result is deterministic.
pub fn flag_outliers(scores: &[f64], contamination: f64) -> Vec<bool> {
    let n = scores.len();
    let n_flag = ((contamination * n as f64).floor() as usize).min(n);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    let mut flags = vec![false; n];
    for &i in order.iter().take(n_flag) {
        flags[i] = true;
    }
    flags
}
