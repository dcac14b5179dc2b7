//! Filter outputs and bookkeeping shared by every filter.

use crate::data::{CellMetadata, FeatureMatrix, Variable};
use crate::filter::expr::Value;
use crate::error::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Statistics about what a filter removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterStats {
    /// Name of the filter that produced these statistics.
    pub filter: String,
    /// Number of cells before filtering.
    pub n_before: usize,
    /// Number of cells after filtering.
    pub n_after: usize,
    /// Number of cells removed.
    pub n_removed: usize,
    /// Proportion of cells retained.
    pub retention_rate: f64,
    /// Feature columns dropped by the filter.
    pub dropped_features: Vec<String>,
}

impl FilterStats {
    pub(crate) fn new(filter: &str, n_before: usize, n_after: usize) -> Self {
        Self {
            filter: filter.to_string(),
            n_before,
            n_after,
            n_removed: n_before - n_after,
            retention_rate: if n_before == 0 {
                1.0
            } else {
                n_after as f64 / n_before as f64
            },
            dropped_features: Vec::new(),
        }
    }
}

impl std::fmt::Display for FilterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Filter Result ({})", self.filter)?;
        writeln!(f, "  Before:    {} cells", self.n_before)?;
        writeln!(f, "  After:     {} cells", self.n_after)?;
        writeln!(f, "  Removed:   {} cells", self.n_removed)?;
        writeln!(f, "  Retained:  {:.1}%", self.retention_rate * 100.0)?;
        if !self.dropped_features.is_empty() {
            writeln!(f, "  Dropped features: {}", self.dropped_features.join(", "))?;
        }
        Ok(())
    }
}

/// Row-aligned metadata and features returned by a filter.
#[derive(Debug, Clone)]
pub struct Filtered {
    pub metadata: CellMetadata,
    pub features: FeatureMatrix,
    pub stats: FilterStats,
}

impl Filtered {
    /// Keep the given rows of both halves.
    pub(crate) fn keep_rows(
        filter: &str,
        metadata: &CellMetadata,
        features: &FeatureMatrix,
        keep: &[usize],
    ) -> Self {
        let stats = FilterStats::new(filter, features.n_cells(), keep.len());
        log::info!(
            "{}: kept {} of {} cells ({:.1}%)",
            filter,
            stats.n_after,
            stats.n_before,
            stats.retention_rate * 100.0
        );
        if stats.n_after == 0 && stats.n_before > 0 {
            log::warn!("{} removed every cell", filter);
        }
        Self {
            metadata: metadata.subset_rows(keep),
            features: features.subset_rows(keep),
            stats,
        }
    }
}

pub(crate) fn check_aligned(metadata: &CellMetadata, features: &FeatureMatrix) -> Result<()> {
    if metadata.n_rows() != features.n_cells() {
        return Err(OpsError::DimensionMismatch {
            expected: features.n_cells(),
            actual: metadata.n_rows(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Metadata(usize),
    Feature(usize),
}

/// Resolves column names of a joined metadata+feature row.
///
/// Metadata columns shadow feature columns of the same name.
pub(crate) struct RowResolver<'a> {
    metadata: &'a CellMetadata,
    features: &'a FeatureMatrix,
    sources: HashMap<&'a str, Source>,
}

impl<'a> RowResolver<'a> {
    /// Resolve `columns`, failing with a schema error naming every unknown column.
    pub(crate) fn new(
        metadata: &'a CellMetadata,
        features: &'a FeatureMatrix,
        columns: &[&str],
    ) -> Result<Self> {
        let mut sources = HashMap::new();
        for (j, name) in features.feature_names().iter().enumerate() {
            sources.insert(name.as_str(), Source::Feature(j));
        }
        for (j, name) in metadata.column_names().iter().enumerate() {
            sources.insert(name.as_str(), Source::Metadata(j));
        }
        let unknown: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !sources.contains_key(c))
            .collect();
        if !unknown.is_empty() {
            return Err(OpsError::missing_columns(unknown));
        }
        Ok(Self {
            metadata,
            features,
            sources,
        })
    }

    pub(crate) fn value(&self, row: usize, column: &str) -> Value {
        match self.sources.get(column) {
            Some(Source::Metadata(j)) => {
                match self.metadata.column_at(*j).get(row) {
                    Some(Variable::Categorical(s)) => Value::Text(s.clone()),
                    Some(Variable::Continuous(v)) => Value::Number(*v),
                    Some(Variable::Ordinal(v)) => Value::Number(*v as f64),
                    Some(Variable::Boolean(b)) => Value::Bool(*b),
                    Some(Variable::Missing) | None => Value::Missing,
                }
            }
            Some(Source::Feature(j)) => {
                let v = self.features.get(row, *j);
                if v.is_nan() {
                    Value::Missing
                } else {
                    Value::Number(v)
                }
            }
            None => Value::Missing,
        }
    }
}
