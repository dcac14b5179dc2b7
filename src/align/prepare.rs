//! Batch and control annotation ahead of alignment.

use crate::data::{CellMetadata, FeatureMatrix, Variable};
use crate::error::{OpsError, Result};
use std::collections::BTreeMap;

/// Derived column holding the composite batch key.
pub const BATCH_VALUES_COL: &str = "batch_values";
/// Derived column flagging control cells.
pub const IS_CONTROL_COL: &str = "is_control";
/// Derived column holding the replicate identity of control cells.
pub const CONTROL_ID_COL: &str = "control_id";

/// Composite batch key for one row: the `batch_cols` values joined by `_`.
pub fn batch_key(batch_cols: &[&[Variable]], row: usize) -> String {
    batch_cols
        .iter()
        .map(|col| col[row].to_string())
        .collect::<Vec<_>>()
        .join("_")
}

/// Annotate cells with batch and control columns.
///
/// Adds `batch_values` (the `batch_cols` values joined by `_`) and
/// `is_control` (perturbation equals `control_key`). When
/// `perturbation_id_col` is given, also adds `control_id`, holding that
/// column's value on control rows and missing elsewhere, so controls can be
/// aggregated per guide. Features are returned unchanged.
///
/// # Errors
/// * `Schema` if any named column is absent
/// * `Config` if `batch_cols` is empty or a batch has no control cells
pub fn prepare_alignment_data(
    metadata: &CellMetadata,
    features: &FeatureMatrix,
    batch_cols: &[String],
    perturbation_col: &str,
    control_key: &str,
    perturbation_id_col: Option<&str>,
) -> Result<(CellMetadata, FeatureMatrix)> {
    if batch_cols.is_empty() {
        return Err(OpsError::config("batch_cols", "at least one column is required"));
    }
    if metadata.n_rows() != features.n_cells() {
        return Err(OpsError::DimensionMismatch {
            expected: features.n_cells(),
            actual: metadata.n_rows(),
        });
    }

    let mut required: Vec<&str> = batch_cols.iter().map(String::as_str).collect();
    required.push(perturbation_col);
    if let Some(id_col) = perturbation_id_col {
        required.push(id_col);
    }
    metadata.require_columns(&required)?;

    let batch_values: Vec<&[Variable]> = batch_cols
        .iter()
        .map(|c| metadata.column(c))
        .collect::<Result<_>>()?;
    let perturbations = metadata.column(perturbation_col)?;

    let n = metadata.n_rows();
    let keys: Vec<String> = (0..n)
        .map(|row| batch_key(&batch_values, row))
        .collect();
    let is_control: Vec<bool> = perturbations
        .iter()
        .map(|p| p.key().as_deref() == Some(control_key))
        .collect();

    // Per-batch (cells, controls)
    let mut batches: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for (key, &ctrl) in keys.iter().zip(&is_control) {
        let entry = batches.entry(key.as_str()).or_default();
        entry.0 += 1;
        if ctrl {
            entry.1 += 1;
        }
    }
    let without_controls: Vec<&str> = batches
        .iter()
        .filter(|(_, (_, n_ctrl))| *n_ctrl == 0)
        .map(|(k, _)| *k)
        .collect();
    if !without_controls.is_empty() {
        return Err(OpsError::config(
            "control_key",
            format!(
                "no '{}' cells in batch(es): {}",
                control_key,
                without_controls.join(", ")
            ),
        ));
    }
    for (key, (n_cells, n_ctrl)) in &batches {
        log::debug!("Batch {}: {} cells, {} controls", key, n_cells, n_ctrl);
    }
    log::info!(
        "Prepared {} batch(es) over {} cells ({} controls)",
        batches.len(),
        n,
        is_control.iter().filter(|&&c| c).count()
    );

    let mut out = metadata
        .with_column(
            BATCH_VALUES_COL,
            keys.into_iter().map(Variable::Categorical).collect(),
        )?
        .with_column(
            IS_CONTROL_COL,
            is_control.iter().map(|&c| Variable::Boolean(c)).collect(),
        )?;
    if let Some(id_col) = perturbation_id_col {
        let ids = metadata.column(id_col)?;
        let control_ids = ids
            .iter()
            .zip(&is_control)
            .map(|(id, &ctrl)| if ctrl { id.clone() } else { Variable::Missing })
            .collect();
        out = out.with_column(CONTROL_ID_COL, control_ids)?;
    }

    Ok((out, features.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(s: &str) -> Variable {
        Variable::Categorical(s.to_string())
    }

    fn create_test_data() -> (CellMetadata, FeatureMatrix) {
        let metadata = CellMetadata::from_columns(
            vec![
                "plate".into(),
                "well".into(),
                "gene_symbol".into(),
                "sgRNA".into(),
            ],
            vec![
                vec![
                    Variable::Ordinal(1),
                    Variable::Ordinal(1),
                    Variable::Ordinal(1),
                    Variable::Ordinal(2),
                    Variable::Ordinal(2),
                ],
                vec![cat("A1"), cat("A1"), cat("A1"), cat("B2"), cat("B2")],
                vec![cat("nontargeting"), cat("TP53"), cat("nontargeting"), cat("KRAS"), cat("nontargeting")],
                vec![cat("nt_1"), cat("tp53_1"), cat("nt_2"), cat("kras_1"), cat("nt_1")],
            ],
        )
        .unwrap();
        let features = FeatureMatrix::from_rows(
            &[vec![1.0], vec![2.0], vec![3.0], vec![4.0], vec![5.0]],
            vec!["area".into()],
        )
        .unwrap();
        (metadata, features)
    }

    #[test]
    fn test_adds_batch_and_control_columns() {
        let (meta, feats) = create_test_data();
        let batch_cols = vec!["plate".to_string(), "well".to_string()];
        let (out, feats_out) =
            prepare_alignment_data(&meta, &feats, &batch_cols, "gene_symbol", "nontargeting", None)
                .unwrap();
        assert_eq!(out.get(0, BATCH_VALUES_COL), Some(&cat("1_A1")));
        assert_eq!(out.get(3, BATCH_VALUES_COL), Some(&cat("2_B2")));
        let controls: Vec<bool> = out
            .column(IS_CONTROL_COL)
            .unwrap()
            .iter()
            .filter_map(Variable::as_bool)
            .collect();
        assert_eq!(controls, vec![true, false, true, false, true]);
        assert!(!out.has_column(CONTROL_ID_COL));
        assert_eq!(feats_out, feats);
    }

    #[test]
    fn test_control_id_only_on_controls() {
        let (meta, feats) = create_test_data();
        let (out, _) = prepare_alignment_data(
            &meta,
            &feats,
            &["plate".to_string()],
            "gene_symbol",
            "nontargeting",
            Some("sgRNA"),
        )
        .unwrap();
        assert_eq!(out.get(0, CONTROL_ID_COL), Some(&cat("nt_1")));
        assert_eq!(out.get(1, CONTROL_ID_COL), Some(&Variable::Missing));
        assert_eq!(out.get(2, CONTROL_ID_COL), Some(&cat("nt_2")));
    }

    #[test]
    fn test_batch_without_controls() {
        let (meta, feats) = create_test_data();
        let subset = meta.subset_rows(&[0, 1, 2, 3]);
        let feats = feats.subset_rows(&[0, 1, 2, 3]);
        let result = prepare_alignment_data(
            &subset,
            &feats,
            &["plate".to_string()],
            "gene_symbol",
            "nontargeting",
            None,
        );
        assert!(matches!(result, Err(OpsError::Config { .. })));
    }

    #[test]
    fn test_missing_columns_named() {
        let (meta, feats) = create_test_data();
        let result = prepare_alignment_data(
            &meta,
            &feats,
            &["tile".to_string()],
            "gene",
            "nontargeting",
            None,
        );
        match result {
            Err(OpsError::Schema { columns, .. }) => {
                assert_eq!(columns, vec!["tile".to_string(), "gene".to_string()])
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }
}
