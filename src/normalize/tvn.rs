//! Typical Variation Normalization (TVN) against control cells.
//!
//! Within each batch the control cells define the reference distribution:
//! embeddings are centered on the control mean and whitened with the inverse
//! symmetric square root of the control covariance, so that controls end up
//! with zero mean and identity covariance in every batch.

use crate::data::CellMetadata;
use crate::error::{OpsError, Result};
use crate::linalg::{column_means, covariance, sorted_symmetric_eigen};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative eigenvalue floor below which a control covariance is singular.
pub const EIGENVALUE_TOLERANCE: f64 = 1e-10;

/// Per-batch whitening summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchWhitening {
    pub batch: String,
    pub n_cells: usize,
    pub n_controls: usize,
    /// Smallest eigenvalue of the control covariance.
    pub min_eigenvalue: f64,
    /// Largest eigenvalue of the control covariance.
    pub max_eigenvalue: f64,
}

/// TVN-normalized embeddings with per-batch summaries.
#[derive(Debug, Clone)]
pub struct TvnMatrix {
    /// Normalized embeddings (cells × components), rows aligned with the input.
    pub data: DMatrix<f64>,
    /// One entry per batch, sorted by batch key.
    pub batches: Vec<BatchWhitening>,
}

/// Normalize embeddings batch by batch against control cells.
///
/// Convenience wrapper over [`tvn_with_summary`] returning only the matrix.
pub fn tvn_on_controls(
    embeddings: &DMatrix<f64>,
    metadata: &CellMetadata,
    perturbation_col: &str,
    control_key: &str,
    batch_col: &str,
) -> Result<DMatrix<f64>> {
    tvn_with_summary(embeddings, metadata, perturbation_col, control_key, batch_col)
        .map(|tvn| tvn.data)
}

/// Normalize embeddings batch by batch against control cells.
///
/// Every row `x` of a batch becomes `(x − μ) W` where `μ` is the control
/// mean and `W = V Λ^{-1/2} Vᵀ` the inverse square root of the control
/// covariance.
///
/// # Errors
/// `AlignmentPrecondition` if a batch has no controls, fewer than `k + 1`
/// controls for `k` dimensions, or a singular control covariance.
pub fn tvn_with_summary(
    embeddings: &DMatrix<f64>,
    metadata: &CellMetadata,
    perturbation_col: &str,
    control_key: &str,
    batch_col: &str,
) -> Result<TvnMatrix> {
    if metadata.n_rows() != embeddings.nrows() {
        return Err(OpsError::DimensionMismatch {
            expected: embeddings.nrows(),
            actual: metadata.n_rows(),
        });
    }
    metadata.require_columns(&[perturbation_col, batch_col])?;
    let perturbations = metadata.column(perturbation_col)?;
    let batch_values = metadata.column(batch_col)?;

    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, b) in batch_values.iter().enumerate() {
        groups.entry(b.to_string()).or_default().push(i);
    }

    let k = embeddings.ncols();
    let results = groups
        .into_par_iter()
        .map(|(batch, rows)| {
            let controls: Vec<usize> = rows
                .iter()
                .copied()
                .filter(|&i| perturbations[i].key().as_deref() == Some(control_key))
                .collect();
            whiten_batch(embeddings, &batch, &rows, &controls, k)
                .map(|(normalized, summary)| (rows, normalized, summary))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut data = DMatrix::zeros(embeddings.nrows(), k);
    let mut batches = Vec::with_capacity(results.len());
    for (rows, normalized, summary) in results {
        for (r, &i) in rows.iter().enumerate() {
            data.row_mut(i).copy_from(&normalized.row(r));
        }
        log::debug!(
            "Batch {}: {} cells whitened against {} controls (eigenvalues {:.3e}..{:.3e})",
            summary.batch,
            summary.n_cells,
            summary.n_controls,
            summary.min_eigenvalue,
            summary.max_eigenvalue
        );
        batches.push(summary);
    }
    log::info!("TVN normalized {} batch(es) in {} dimensions", batches.len(), k);

    Ok(TvnMatrix { data, batches })
}

fn whiten_batch(
    embeddings: &DMatrix<f64>,
    batch: &str,
    rows: &[usize],
    controls: &[usize],
    k: usize,
) -> Result<(DMatrix<f64>, BatchWhitening)> {
    if controls.is_empty() {
        return Err(OpsError::AlignmentPrecondition(format!(
            "batch '{}' has no control cells",
            batch
        )));
    }
    if controls.len() < k + 1 {
        return Err(OpsError::AlignmentPrecondition(format!(
            "batch '{}' has {} control cells, need at least {} for {} dimensions",
            batch,
            controls.len(),
            k + 1,
            k
        )));
    }

    let ctrl = embeddings.select_rows(controls.iter());
    let mean = column_means(&ctrl);
    let eig = sorted_symmetric_eigen(covariance(&ctrl, &mean));
    let largest = eig.values.first().copied().unwrap_or(0.0);
    let smallest = eig.values.last().copied().unwrap_or(0.0);
    if largest <= 0.0 || smallest <= EIGENVALUE_TOLERANCE * largest {
        return Err(OpsError::AlignmentPrecondition(format!(
            "control covariance of batch '{}' is singular (smallest eigenvalue {:.3e})",
            batch, smallest
        )));
    }

    let inv_sqrt = DVector::from_iterator(k, eig.values.iter().map(|v| 1.0 / v.sqrt()));
    let whitening = &eig.vectors * DMatrix::from_diagonal(&inv_sqrt) * eig.vectors.transpose();

    let batch_rows = embeddings.select_rows(rows.iter());
    let centered = DMatrix::from_fn(rows.len(), k, |i, j| batch_rows[(i, j)] - mean[j]);
    let normalized = centered * whitening;

    Ok((
        normalized,
        BatchWhitening {
            batch: batch.to_string(),
            n_cells: rows.len(),
            n_controls: controls.len(),
            min_eigenvalue: smallest,
            max_eigenvalue: largest,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Variable;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    const CONTROL: &str = "nontargeting";

    /// Two batches with different offsets and scales, 30 controls and 10
    /// perturbed cells each.
    fn create_test_data() -> (DMatrix<f64>, CellMetadata) {
        let mut rng = ChaCha20Rng::seed_from_u64(17);
        let mut values = Vec::new();
        let mut genes = Vec::new();
        let mut batches = Vec::new();
        for (batch, offset, scale) in [("1_A1", 5.0, 2.0), ("1_B2", -3.0, 0.5)] {
            for i in 0..40 {
                let x: f64 = rng.gen_range(-1.0..1.0);
                let y: f64 = rng.gen_range(-1.0..1.0);
                values.push(offset + scale * x);
                values.push(offset * 0.5 + scale * (x * 0.3 + y));
                genes.push(Variable::Categorical(
                    if i < 30 { CONTROL } else { "TP53" }.to_string(),
                ));
                batches.push(Variable::Categorical(batch.to_string()));
            }
        }
        let embeddings = DMatrix::from_row_slice(80, 2, &values);
        let metadata = CellMetadata::from_columns(
            vec!["gene_symbol".into(), "batch_values".into()],
            vec![genes, batches],
        )
        .unwrap();
        (embeddings, metadata)
    }

    #[test]
    fn test_controls_whitened_per_batch() {
        let (emb, meta) = create_test_data();
        let out = tvn_with_summary(&emb, &meta, "gene_symbol", CONTROL, "batch_values").unwrap();
        assert_eq!(out.batches.len(), 2);
        for start in [0, 40] {
            let controls: Vec<usize> = (start..start + 30).collect();
            let ctrl = out.data.select_rows(controls.iter());
            let mean = column_means(&ctrl);
            let cov = covariance(&ctrl, &mean);
            for j in 0..2 {
                assert_relative_eq!(mean[j], 0.0, epsilon = 1e-9);
                for l in 0..2 {
                    let expected = if j == l { 1.0 } else { 0.0 };
                    assert_relative_eq!(cov[(j, l)], expected, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_rows_stay_aligned() {
        let (emb, meta) = create_test_data();
        let a = tvn_on_controls(&emb, &meta, "gene_symbol", CONTROL, "batch_values").unwrap();
        assert_eq!(a.shape(), emb.shape());
        // shuffling the batches' order in the input must not change per-row output
        let order: Vec<usize> = (40..80).chain(0..40).collect();
        let emb2 = emb.select_rows(order.iter());
        let meta2 = meta.subset_rows(&order);
        let b = tvn_on_controls(&emb2, &meta2, "gene_symbol", CONTROL, "batch_values").unwrap();
        for (r, &i) in order.iter().enumerate() {
            for j in 0..2 {
                assert_relative_eq!(b[(r, j)], a[(i, j)], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_batch_without_controls() {
        let (emb, meta) = create_test_data();
        let rows: Vec<usize> = (0..40).chain(70..80).collect();
        let result = tvn_on_controls(
            &emb.select_rows(rows.iter()),
            &meta.subset_rows(&rows),
            "gene_symbol",
            CONTROL,
            "batch_values",
        );
        assert!(matches!(result, Err(OpsError::AlignmentPrecondition(_))));
    }

    #[test]
    fn test_too_few_controls() {
        let (emb, meta) = create_test_data();
        // two controls for two dimensions in the second batch
        let rows: Vec<usize> = (0..40).chain(40..42).chain(70..80).collect();
        let result = tvn_on_controls(
            &emb.select_rows(rows.iter()),
            &meta.subset_rows(&rows),
            "gene_symbol",
            CONTROL,
            "batch_values",
        );
        assert!(matches!(result, Err(OpsError::AlignmentPrecondition(_))));
    }

    #[test]
    fn test_small_scale_controls_accepted() {
        let (emb, meta) = create_test_data();
        let scaled = emb * 1e-6;
        let out = tvn_with_summary(&scaled, &meta, "gene_symbol", CONTROL, "batch_values").unwrap();
        for summary in &out.batches {
            assert!(summary.max_eigenvalue < 1e-10);
        }
        let ctrl = out.data.select_rows((0..30).collect::<Vec<_>>().iter());
        let mean = column_means(&ctrl);
        let cov = covariance(&ctrl, &mean);
        for j in 0..2 {
            for l in 0..2 {
                let expected = if j == l { 1.0 } else { 0.0 };
                assert_relative_eq!(cov[(j, l)], expected, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_singular_control_covariance() {
        let mut emb = DMatrix::zeros(6, 2);
        for i in 0..6 {
            emb[(i, 0)] = i as f64;
            emb[(i, 1)] = 2.0 * i as f64;
        }
        let meta = CellMetadata::from_columns(
            vec!["gene_symbol".into(), "batch_values".into()],
            vec![
                vec![Variable::Categorical(CONTROL.into()); 6],
                vec![Variable::Categorical("b".into()); 6],
            ],
        )
        .unwrap();
        let result = tvn_on_controls(&emb, &meta, "gene_symbol", CONTROL, "batch_values");
        assert!(matches!(result, Err(OpsError::AlignmentPrecondition(_))));
    }
}
