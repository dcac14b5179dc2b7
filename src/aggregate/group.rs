//! Grouping cells into per-perturbation profiles.

use crate::aggregate::table::{AggregateRecord, AggregateTable};
use crate::align::CONTROL_ID_COL;
use crate::data::{CellMetadata, Variable};
use crate::embed::component_names;
use crate::error::{OpsError, Result};
use crate::stats::{mean, median};
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Statistic used to combine cells within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggMethod {
    #[default]
    Mean,
    /// Per-dimension median.
    Median,
}

impl std::str::FromStr for AggMethod {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mean" => Ok(AggMethod::Mean),
            "median" => Ok(AggMethod::Median),
            other => Err(OpsError::config("agg_method", other)),
        }
    }
}

/// Options controlling aggregation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateOptions {
    /// Group control cells by their `control_id` instead of the control key.
    pub split_controls: bool,
    /// Metadata columns whose first observed value is carried per group.
    pub collapse_cols: Vec<String>,
    /// Names of the embedding dimensions; `PC_0..` when absent.
    pub feature_names: Option<Vec<String>>,
    /// Sort the output by cell count, largest first.
    pub sort_by_cell_count: bool,
}

/// Aggregate cell embeddings into one profile per perturbation.
///
/// Rows with a missing perturbation are skipped. Groups are ordered by name
/// unless `options.sort_by_cell_count` is set.
///
/// # Errors
/// * `Schema` if `perturbation_col`, a collapse column, or `control_id`
///   (with `split_controls`) is absent
/// * `DimensionMismatch` if metadata and embeddings are not row-aligned
pub fn aggregate(
    embeddings: &DMatrix<f64>,
    metadata: &CellMetadata,
    perturbation_col: &str,
    method: AggMethod,
    options: &AggregateOptions,
) -> Result<AggregateTable> {
    if metadata.n_rows() != embeddings.nrows() {
        return Err(OpsError::DimensionMismatch {
            expected: embeddings.nrows(),
            actual: metadata.n_rows(),
        });
    }
    let feature_names = match &options.feature_names {
        Some(names) if names.len() != embeddings.ncols() => {
            return Err(OpsError::DimensionMismatch {
                expected: embeddings.ncols(),
                actual: names.len(),
            });
        }
        Some(names) => names.clone(),
        None => component_names(embeddings.ncols()),
    };

    let mut required: Vec<&str> = vec![perturbation_col];
    required.extend(options.collapse_cols.iter().map(String::as_str));
    if options.split_controls {
        required.push(CONTROL_ID_COL);
    }
    metadata.require_columns(&required)?;

    let perturbations = metadata.column(perturbation_col)?;
    let control_ids = if options.split_controls {
        Some(metadata.column(CONTROL_ID_COL)?)
    } else {
        None
    };

    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut n_skipped = 0;
    for (i, p) in perturbations.iter().enumerate() {
        let key = control_ids
            .and_then(|ids| ids[i].key())
            .or_else(|| p.key());
        match key {
            Some(k) => groups.entry(k).or_default().push(i),
            None => n_skipped += 1,
        }
    }
    if n_skipped > 0 {
        log::warn!("Skipped {} cells without a perturbation", n_skipped);
    }

    let collapse: Vec<&[Variable]> = options
        .collapse_cols
        .iter()
        .map(|c| metadata.column(c))
        .collect::<Result<_>>()?;

    let k = embeddings.ncols();
    let mut records: Vec<AggregateRecord> = groups
        .into_par_iter()
        .map(|(name, rows)| {
            let features = (0..k)
                .map(|j| {
                    let values: Vec<f64> = rows.iter().map(|&i| embeddings[(i, j)]).collect();
                    match method {
                        AggMethod::Mean => mean(&values),
                        AggMethod::Median => median(values),
                    }
                })
                .collect();
            let collapsed = collapse
                .iter()
                .map(|col| {
                    rows.iter()
                        .map(|&i| &col[i])
                        .find(|v| !v.is_missing())
                        .cloned()
                        .unwrap_or(Variable::Missing)
                })
                .collect();
            AggregateRecord {
                perturbation: name,
                features,
                cell_count: rows.len(),
                collapsed,
            }
        })
        .collect();

    if options.sort_by_cell_count {
        records.sort_by(|a, b| b.cell_count.cmp(&a.cell_count));
    }
    log::info!(
        "Aggregated {} cells into {} groups ({:?})",
        records.iter().map(|r| r.cell_count).sum::<usize>(),
        records.len(),
        method
    );

    AggregateTable::new(feature_names, options.collapse_cols.clone(), records)
}
