//! Batch-wise PCA embedding.
//!
//! A single principal-component basis is fit on a (possibly subsampled) set
//! of cells and then used to project every cell, chunk by chunk, so that all
//! batches share one coordinate system.

use crate::data::FeatureMatrix;
use crate::error::{OpsError, Result};
use crate::linalg::{center, column_means, covariance, sorted_symmetric_eigen};
use nalgebra::{DMatrix, DVector};
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

/// Default maximum number of cells used to fit the basis.
pub const DEFAULT_SAMPLE_CAP: usize = 1_000_000;

/// Number of components to retain.
///
/// In YAML an integer means a component count and a float a variance
/// fraction: `variance_or_ncomp: 10` or `variance_or_ncomp: 0.95`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarianceOrNcomp {
    /// Keep exactly this many components.
    Components(usize),
    /// Keep the fewest components reaching this cumulative variance ratio.
    Variance(f64),
}

impl Default for VarianceOrNcomp {
    fn default() -> Self {
        VarianceOrNcomp::Variance(0.95)
    }
}

/// Configuration for PCA embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaConfig {
    pub variance_or_ncomp: VarianceOrNcomp,
    /// Number of contiguous row chunks used for projection.
    pub num_align_batches: usize,
    /// Maximum number of cells used to fit the basis.
    pub sample_cap: usize,
    /// Seed for subsampling when the input exceeds `sample_cap`.
    pub seed: u64,
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self {
            variance_or_ncomp: VarianceOrNcomp::default(),
            num_align_batches: 1,
            sample_cap: DEFAULT_SAMPLE_CAP,
            seed: 42,
        }
    }
}

impl PcaConfig {
    /// Check parameter ranges against a feature dimension `d`.
    pub fn validate(&self, d: usize) -> Result<()> {
        match self.variance_or_ncomp {
            VarianceOrNcomp::Variance(f) if !(f > 0.0 && f < 1.0) => {
                return Err(OpsError::config("variance_or_ncomp", f));
            }
            VarianceOrNcomp::Components(k) if k == 0 || k > d => {
                return Err(OpsError::config(
                    "variance_or_ncomp",
                    format!("{} components requested for {} features", k, d),
                ));
            }
            _ => {}
        }
        if self.num_align_batches == 0 {
            return Err(OpsError::config("num_align_batches", 0));
        }
        if self.sample_cap < 2 {
            return Err(OpsError::config("pca_sample_cap", self.sample_cap));
        }
        Ok(())
    }
}

/// A fitted principal-component basis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaBasis {
    /// Components as rows (k × d), orthonormal.
    pub components: DMatrix<f64>,
    /// Variance explained by each component.
    pub explained_variance: Vec<f64>,
    /// Fraction of total variance explained by each component.
    pub explained_variance_ratio: Vec<f64>,
    /// Feature means used for centering.
    pub mean: DVector<f64>,
    /// Number of cells the basis was fit on.
    pub n_samples_fit: usize,
}

impl PcaBasis {
    /// Fit on the rows of `data`, keeping components per `selection`.
    pub fn fit(data: &DMatrix<f64>, selection: VarianceOrNcomp) -> Result<Self> {
        let (n, d) = data.shape();
        if n < 2 {
            return Err(OpsError::EmptyData(format!(
                "PCA needs at least two cells, got {}",
                n
            )));
        }
        if d == 0 {
            return Err(OpsError::EmptyData("PCA needs at least one feature".to_string()));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(OpsError::AlignmentPrecondition(
                "PCA input holds missing or infinite values".to_string(),
            ));
        }

        let mean = column_means(data);
        let eig = sorted_symmetric_eigen(covariance(data, &mean));
        let variances: Vec<f64> = eig.values.iter().map(|&v| v.max(0.0)).collect();
        let total: f64 = variances.iter().sum();
        if total <= 0.0 {
            return Err(OpsError::AlignmentPrecondition(
                "features have zero total variance".to_string(),
            ));
        }
        let ratios: Vec<f64> = variances.iter().map(|v| v / total).collect();

        let k = match selection {
            VarianceOrNcomp::Components(k) => k.min(d),
            VarianceOrNcomp::Variance(f) => {
                let mut cumulative = 0.0;
                let mut k = d;
                for (i, r) in ratios.iter().enumerate() {
                    cumulative += r;
                    if cumulative >= f - 1e-12 {
                        k = i + 1;
                        break;
                    }
                }
                k
            }
        };

        let mut components = DMatrix::zeros(k, d);
        for c in 0..k {
            let v = eig.vectors.column(c);
            // Largest-magnitude loading is positive
            let pivot = v
                .iter()
                .enumerate()
                .fold((0, 0.0f64), |best, (j, &x)| {
                    if x.abs() > best.1.abs() {
                        (j, x)
                    } else {
                        best
                    }
                })
                .1;
            let sign = if pivot < 0.0 { -1.0 } else { 1.0 };
            for j in 0..d {
                components[(c, j)] = sign * v[j];
            }
        }

        Ok(Self {
            components,
            explained_variance: variances[..k].to_vec(),
            explained_variance_ratio: ratios[..k].to_vec(),
            mean,
            n_samples_fit: n,
        })
    }

    /// Number of retained components.
    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    /// Number of input features.
    pub fn n_features(&self) -> usize {
        self.components.ncols()
    }

    /// Cumulative explained variance ratio of the retained components.
    pub fn cumulative_variance_ratio(&self) -> f64 {
        self.explained_variance_ratio.iter().sum()
    }

    /// Project rows of `data` onto the basis.
    pub fn transform(&self, data: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if data.ncols() != self.n_features() {
            return Err(OpsError::DimensionMismatch {
                expected: self.n_features(),
                actual: data.ncols(),
            });
        }
        Ok(center(data, &self.mean) * self.components.transpose())
    }
}

/// PCA embeddings for every cell.
#[derive(Debug, Clone)]
pub struct PcaEmbedding {
    /// Cells × components.
    pub embeddings: DMatrix<f64>,
    pub basis: PcaBasis,
    pub n_components: usize,
}

impl PcaEmbedding {
    /// Column names for the embedding dimensions: `PC_0`, `PC_1`, ...
    pub fn component_names(&self) -> Vec<String> {
        component_names(self.n_components)
    }
}

/// Names `PC_0..PC_{k-1}`.
pub fn component_names(k: usize) -> Vec<String> {
    (0..k).map(|i| format!("PC_{}", i)).collect()
}

/// Fit a PCA basis and project every cell.
///
/// # Errors
/// * `AlignmentPrecondition` if any feature value is missing or infinite
/// * `Config` on invalid parameters
pub fn embed_by_pca(features: &FeatureMatrix, config: &PcaConfig) -> Result<PcaEmbedding> {
    config.validate(features.n_features())?;
    if let Some(j) = features.missing_per_feature().iter().position(|&m| m > 0) {
        return Err(OpsError::AlignmentPrecondition(format!(
            "feature '{}' holds missing values; impute before PCA",
            features.feature_names()[j]
        )));
    }
    if let Some(j) = (0..features.n_features())
        .find(|&j| features.matrix().column(j).iter().any(|v| v.is_infinite()))
    {
        return Err(OpsError::AlignmentPrecondition(format!(
            "feature '{}' holds infinite values",
            features.feature_names()[j]
        )));
    }

    let data = features.matrix();
    let n = data.nrows();
    let basis = if n > config.sample_cap {
        let mut rng = ChaCha20Rng::seed_from_u64(config.seed);
        let mut rows = sample(&mut rng, n, config.sample_cap).into_vec();
        rows.sort_unstable();
        log::info!("Fitting PCA on {} of {} cells", rows.len(), n);
        PcaBasis::fit(&data.select_rows(rows.iter()), config.variance_or_ncomp)?
    } else {
        PcaBasis::fit(data, config.variance_or_ncomp)?
    };
    let k = basis.n_components();
    log::info!(
        "Retained {} of {} components ({:.1}% variance)",
        k,
        features.n_features(),
        basis.cumulative_variance_ratio() * 100.0
    );

    let chunk = n.div_ceil(config.num_align_batches).max(1);
    let mut embeddings = DMatrix::zeros(n, k);
    for (b, start) in (0..n).step_by(chunk).enumerate() {
        let rows = chunk.min(n - start);
        let projected = basis.transform(&data.rows(start, rows).into_owned())?;
        embeddings.rows_mut(start, rows).copy_from(&projected);
        log::debug!("Projected chunk {} ({} cells)", b, rows);
    }

    Ok(PcaEmbedding {
        embeddings,
        basis,
        n_components: k,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;

    fn create_features(n: usize, seed: u64) -> FeatureMatrix {
        // Three latent directions with decreasing spread across five features
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|_| {
                let a: f64 = rng.gen_range(-10.0..10.0);
                let b: f64 = rng.gen_range(-3.0..3.0);
                let c: f64 = rng.gen_range(-0.5..0.5);
                vec![a + b, a - b, b + c, c, a * 0.5 + c]
            })
            .collect();
        FeatureMatrix::from_rows(&rows, (0..5).map(|j| format!("f{}", j)).collect()).unwrap()
    }

    #[test]
    fn test_components_orthonormal() {
        let feats = create_features(200, 1);
        let config = PcaConfig {
            variance_or_ncomp: VarianceOrNcomp::Components(3),
            ..Default::default()
        };
        let out = embed_by_pca(&feats, &config).unwrap();
        assert_eq!(out.embeddings.shape(), (200, 3));
        let gram = &out.basis.components * out.basis.components.transpose();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(gram[(i, j)], expected, epsilon = 1e-9);
            }
        }
        // variances descending
        let ev = &out.basis.explained_variance;
        assert!(ev[0] >= ev[1] && ev[1] >= ev[2]);
    }

    #[test]
    fn test_largest_loading_positive() {
        let feats = create_features(150, 2);
        let config = PcaConfig {
            variance_or_ncomp: VarianceOrNcomp::Components(4),
            ..Default::default()
        };
        let out = embed_by_pca(&feats, &config).unwrap();
        for c in 0..4 {
            let row = out.basis.components.row(c);
            let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let min = row.iter().cloned().fold(f64::INFINITY, f64::min);
            assert!(max >= min.abs());
        }
    }

    #[test]
    fn test_variance_selection_monotone() {
        let feats = create_features(300, 3);
        let mut last = 0;
        for f in [0.5, 0.8, 0.9, 0.99, 0.999999] {
            let config = PcaConfig {
                variance_or_ncomp: VarianceOrNcomp::Variance(f),
                ..Default::default()
            };
            let out = embed_by_pca(&feats, &config).unwrap();
            assert!(out.n_components >= last);
            assert!(out.basis.cumulative_variance_ratio() >= f - 1e-12);
            last = out.n_components;
        }
    }

    #[test]
    fn test_chunked_projection_matches_whole() {
        let feats = create_features(101, 4);
        let whole = embed_by_pca(&feats, &PcaConfig::default()).unwrap();
        let chunked = embed_by_pca(
            &feats,
            &PcaConfig {
                num_align_batches: 7,
                ..Default::default()
            },
        )
        .unwrap();
        assert_relative_eq!(whole.embeddings, chunked.embeddings, epsilon = 1e-12);
    }

    #[test]
    fn test_subsampled_fit_deterministic() {
        let feats = create_features(400, 5);
        let config = PcaConfig {
            sample_cap: 100,
            seed: 9,
            ..Default::default()
        };
        let a = embed_by_pca(&feats, &config).unwrap();
        let b = embed_by_pca(&feats, &config).unwrap();
        assert_eq!(a.basis.n_samples_fit, 100);
        assert_eq!(a.embeddings, b.embeddings);
    }

    #[test]
    fn test_missing_values_rejected() {
        let feats = FeatureMatrix::from_rows(
            &[vec![1.0, 2.0], vec![f64::NAN, 1.0], vec![3.0, 0.0]],
            vec!["a".into(), "b".into()],
        )
        .unwrap();
        assert!(matches!(
            embed_by_pca(&feats, &PcaConfig::default()),
            Err(OpsError::AlignmentPrecondition(_))
        ));
    }

    #[test]
    fn test_infinite_values_rejected() {
        let feats = FeatureMatrix::from_rows(
            &[vec![1.0, 2.0], vec![3.0, f64::INFINITY], vec![3.0, 0.0]],
            vec!["cell_area".into(), "nucleus_area".into()],
        )
        .unwrap();
        match embed_by_pca(&feats, &PcaConfig::default()) {
            Err(OpsError::AlignmentPrecondition(msg)) => assert!(msg.contains("nucleus_area")),
            other => panic!("expected alignment precondition error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_parameters() {
        let feats = create_features(20, 6);
        for selection in [
            VarianceOrNcomp::Variance(1.0),
            VarianceOrNcomp::Variance(0.0),
            VarianceOrNcomp::Components(0),
            VarianceOrNcomp::Components(6),
        ] {
            let config = PcaConfig {
                variance_or_ncomp: selection,
                ..Default::default()
            };
            assert!(matches!(
                embed_by_pca(&feats, &config),
                Err(OpsError::Config { .. })
            ));
        }
    }

    #[test]
    fn test_variance_or_ncomp_yaml() {
        let k: VarianceOrNcomp = serde_yaml::from_str("10").unwrap();
        assert_eq!(k, VarianceOrNcomp::Components(10));
        let f: VarianceOrNcomp = serde_yaml::from_str("0.95").unwrap();
        assert_eq!(f, VarianceOrNcomp::Variance(0.95));
    }
}
