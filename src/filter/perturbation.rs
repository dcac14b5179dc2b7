//! Drop cells without an assigned perturbation.

use crate::data::{CellMetadata, FeatureMatrix};
use crate::error::Result;
use crate::filter::stats::{check_aligned, Filtered};
use std::collections::HashSet;

/// Result of perturbation filtering.
#[derive(Debug, Clone)]
pub struct PerturbationFiltered {
    /// Surviving cells.
    pub cells: Filtered,
    /// Number of unique perturbations among surviving cells.
    pub n_perturbations: usize,
}

/// Keep cells whose `perturbation_col` value is present.
pub fn filter_perturbation(
    metadata: &CellMetadata,
    features: &FeatureMatrix,
    perturbation_col: &str,
) -> Result<PerturbationFiltered> {
    check_aligned(metadata, features)?;
    let values = metadata.column(perturbation_col)?;

    let keep: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_missing())
        .map(|(i, _)| i)
        .collect();
    let n_perturbations = keep
        .iter()
        .filter_map(|&i| values[i].key())
        .collect::<HashSet<_>>()
        .len();

    let cells = Filtered::keep_rows("perturbation filter", metadata, features, &keep);
    log::info!(
        "{} unique values of '{}' after perturbation filter",
        n_perturbations,
        perturbation_col
    );
    Ok(PerturbationFiltered {
        cells,
        n_perturbations,
    })
}
