//! Missing-value filtering and imputation.
//!
//! Columns with too many missing values are dropped first, then rows, and
//! finally any remaining gaps are imputed. PCA downstream is undefined on
//! missing values, so the output of this filter is either complete or an
//! error.

use crate::data::{CellMetadata, FeatureMatrix};
use crate::error::{OpsError, Result};
use crate::filter::stats::{check_aligned, Filtered, FilterStats};
use crate::stats::{mean, median};
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Statistic used to fill remaining missing values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImputeMethod {
    #[default]
    Median,
    Mean,
}

/// Configuration for the missing-value filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingValueConfig {
    /// Drop a feature if its missing fraction exceeds this value.
    pub drop_cols_threshold: f64,
    /// Drop a cell if its missing fraction (over kept features) exceeds this value.
    pub drop_rows_threshold: f64,
    /// Fill remaining missing values instead of failing.
    pub impute: bool,
    /// Statistic used for imputation.
    pub method: ImputeMethod,
}

impl Default for MissingValueConfig {
    fn default() -> Self {
        Self {
            drop_cols_threshold: 0.1,
            drop_rows_threshold: 0.01,
            impute: true,
            method: ImputeMethod::Median,
        }
    }
}

/// Remove incomplete features and cells, then impute what remains.
///
/// # Errors
/// * `Config` if a threshold is outside [0, 1]
/// * `AlignmentPrecondition` if missing values remain and `impute` is off,
///   or a kept feature has no observed values to impute from
pub fn filter_missing(
    metadata: &CellMetadata,
    features: &FeatureMatrix,
    config: &MissingValueConfig,
) -> Result<Filtered> {
    check_aligned(metadata, features)?;
    for (name, value) in [
        ("drop_cols_threshold", config.drop_cols_threshold),
        ("drop_rows_threshold", config.drop_rows_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(OpsError::config(name, value));
        }
    }

    let n_cells = features.n_cells();

    // Column pruning
    let missing = features.missing_per_feature();
    let mut kept_cols = Vec::new();
    let mut dropped = Vec::new();
    for (j, &n_missing) in missing.iter().enumerate() {
        let frac = if n_cells == 0 {
            0.0
        } else {
            n_missing as f64 / n_cells as f64
        };
        if frac > config.drop_cols_threshold {
            dropped.push(features.feature_names()[j].clone());
        } else {
            kept_cols.push(j);
        }
    }
    let pruned = features.subset_features(&kept_cols)?;
    if !dropped.is_empty() {
        log::info!(
            "Dropped {} feature(s) above {:.1}% missing",
            dropped.len(),
            config.drop_cols_threshold * 100.0
        );
        log::debug!("Dropped features: {}", dropped.join(", "));
    }

    // Row pruning
    let n_features = pruned.n_features();
    let keep: Vec<usize> = (0..n_cells)
        .into_par_iter()
        .filter(|&i| {
            if n_features == 0 {
                return true;
            }
            let n_missing = pruned.matrix().row(i).iter().filter(|v| v.is_nan()).count();
            n_missing as f64 / n_features as f64 <= config.drop_rows_threshold
        })
        .collect();
    let rows = Filtered::keep_rows("missing-value filter", metadata, &pruned, &keep);

    let features = if config.impute {
        impute(&rows.features, config.method)?
    } else {
        if let Some(j) = rows
            .features
            .missing_per_feature()
            .iter()
            .position(|&n| n > 0)
        {
            return Err(OpsError::AlignmentPrecondition(format!(
                "feature '{}' still has missing values and imputation is disabled",
                rows.features.feature_names()[j]
            )));
        }
        rows.features
    };

    let mut stats = FilterStats::new("missing-value filter", n_cells, keep.len());
    stats.dropped_features = dropped;
    Ok(Filtered {
        metadata: rows.metadata,
        features,
        stats,
    })
}

/// Fill missing values with a per-feature statistic over observed values.
pub fn impute(features: &FeatureMatrix, method: ImputeMethod) -> Result<FeatureMatrix> {
    let n_cells = features.n_cells();
    let fills: Vec<Option<f64>> = (0..features.n_features())
        .into_par_iter()
        .map(|j| {
            let column = features.matrix().column(j);
            if !column.iter().any(|v| v.is_nan()) {
                return Ok(None);
            }
            let observed: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
            if observed.is_empty() {
                return Err(OpsError::AlignmentPrecondition(format!(
                    "feature '{}' has no observed values to impute from",
                    features.feature_names()[j]
                )));
            }
            let fill = match method {
                ImputeMethod::Median => median(observed),
                ImputeMethod::Mean => mean(&observed),
            };
            Ok(Some(fill))
        })
        .collect::<Result<Vec<_>>>()?;

    let n_filled = features.n_missing();
    let source = features.matrix();
    let data = DMatrix::from_fn(n_cells, features.n_features(), |i, j| {
        let v = source[(i, j)];
        match fills[j] {
            Some(fill) if v.is_nan() => fill,
            _ => v,
        }
    });
    if n_filled > 0 {
        log::info!("Imputed {} missing value(s) with {:?}", n_filled, method);
    }
    FeatureMatrix::new(data, features.feature_names().to_vec())
}
