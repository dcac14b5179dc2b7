//! Per-cell metadata columns.

use crate::error::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Tokens read as a missing value.
pub(crate) const MISSING_TOKENS: &[&str] = &["", "NA", "na", "NaN", "nan", "null", "None"];

/// A metadata value that can be categorical, continuous, ordinal, or boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// Categorical variable with string levels.
    Categorical(String),
    /// Continuous numeric variable.
    Continuous(f64),
    /// Integer-valued variable such as a plate number or gene id.
    Ordinal(i64),
    /// Boolean flag.
    Boolean(bool),
    /// Missing value.
    Missing,
}

impl Variable {
    /// Parse a raw field, treating the usual NA tokens as missing.
    pub fn parse(raw: &str, numeric: bool) -> Self {
        let raw = raw.trim();
        if MISSING_TOKENS.contains(&raw) {
            return Variable::Missing;
        }
        if numeric {
            raw.parse::<f64>()
                .map(Variable::Continuous)
                .unwrap_or(Variable::Missing)
        } else {
            Variable::Categorical(raw.to_string())
        }
    }

    /// Check if this is a missing value.
    pub fn is_missing(&self) -> bool {
        matches!(self, Variable::Missing)
    }

    /// Try to get as categorical string.
    pub fn as_categorical(&self) -> Option<&str> {
        match self {
            Variable::Categorical(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view: continuous and ordinal values, booleans as 0/1.
    pub fn as_continuous(&self) -> Option<f64> {
        match self {
            Variable::Continuous(v) => Some(*v),
            Variable::Ordinal(v) => Some(*v as f64),
            Variable::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Try to get as a boolean flag.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variable::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// String key used for grouping and comparison with string literals.
    ///
    /// Returns `None` for missing values.
    pub fn key(&self) -> Option<String> {
        if self.is_missing() {
            None
        } else {
            Some(self.to_string())
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::Categorical(s) => write!(f, "{}", s),
            Variable::Continuous(v) => write!(f, "{}", v),
            Variable::Ordinal(v) => write!(f, "{}", v),
            Variable::Boolean(b) => write!(f, "{}", b),
            Variable::Missing => write!(f, "NA"),
        }
    }
}

/// Metadata columns for a set of cells, stored column-major.
///
/// Row `i` of every column describes the same cell as row `i` of the
/// companion [`FeatureMatrix`](crate::data::FeatureMatrix).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellMetadata {
    column_names: Vec<String>,
    columns: Vec<Vec<Variable>>,
    n_rows: usize,
}

impl CellMetadata {
    /// Create metadata with no columns and `n_rows` rows.
    pub fn with_rows(n_rows: usize) -> Self {
        Self {
            column_names: Vec::new(),
            columns: Vec::new(),
            n_rows,
        }
    }

    /// Build metadata from named columns of equal length.
    pub fn from_columns(column_names: Vec<String>, columns: Vec<Vec<Variable>>) -> Result<Self> {
        if column_names.len() != columns.len() {
            return Err(OpsError::DimensionMismatch {
                expected: column_names.len(),
                actual: columns.len(),
            });
        }
        let n_rows = columns.first().map(Vec::len).unwrap_or(0);
        for col in &columns {
            if col.len() != n_rows {
                return Err(OpsError::DimensionMismatch {
                    expected: n_rows,
                    actual: col.len(),
                });
            }
        }
        Ok(Self {
            column_names,
            columns,
            n_rows,
        })
    }

    /// Column names in order.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Number of rows (cells).
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of columns.
    pub fn n_columns(&self) -> usize {
        self.column_names.len()
    }

    /// Check if a column exists.
    pub fn has_column(&self, column: &str) -> bool {
        self.column_index(column).is_some()
    }

    /// Position of a column.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == column)
    }

    /// All values of a column.
    pub fn column(&self, column: &str) -> Result<&[Variable]> {
        self.column_index(column)
            .map(|idx| self.columns[idx].as_slice())
            .ok_or_else(|| OpsError::missing_columns([column]))
    }

    /// Values of the column at position `idx`.
    ///
    /// Panics if `idx` is out of range.
    pub fn column_at(&self, idx: usize) -> &[Variable] {
        &self.columns[idx]
    }

    /// Value for a row and column.
    pub fn get(&self, row: usize, column: &str) -> Option<&Variable> {
        self.column_index(column)
            .and_then(|idx| self.columns[idx].get(row))
    }

    /// Fail with a schema error listing every absent column.
    pub fn require_columns(&self, columns: &[&str]) -> Result<()> {
        let missing: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !self.has_column(c))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OpsError::missing_columns(missing))
        }
    }

    /// Return a copy with `column` added, or replaced if it already exists.
    pub fn with_column(&self, column: &str, values: Vec<Variable>) -> Result<Self> {
        if values.len() != self.n_rows {
            return Err(OpsError::DimensionMismatch {
                expected: self.n_rows,
                actual: values.len(),
            });
        }
        let mut out = self.clone();
        match out.column_index(column) {
            Some(idx) => out.columns[idx] = values,
            None => {
                out.column_names.push(column.to_string());
                out.columns.push(values);
            }
        }
        Ok(out)
    }

    /// Keep only the given rows, in the given order.
    pub fn subset_rows(&self, indices: &[usize]) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|col| indices.iter().map(|&i| col[i].clone()).collect())
            .collect();
        Self {
            column_names: self.column_names.clone(),
            columns,
            n_rows: indices.len(),
        }
    }

    /// Sorted unique non-missing values of a column, rendered as strings.
    pub fn levels(&self, column: &str) -> Result<Vec<String>> {
        let levels: BTreeSet<String> = self
            .column(column)?
            .iter()
            .filter_map(Variable::key)
            .collect();
        Ok(levels.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_metadata() -> CellMetadata {
        CellMetadata::from_columns(
            vec!["plate".into(), "gene".into()],
            vec![
                vec![
                    Variable::Continuous(1.0),
                    Variable::Continuous(1.0),
                    Variable::Continuous(2.0),
                ],
                vec![
                    Variable::Categorical("nontargeting".into()),
                    Variable::Missing,
                    Variable::Categorical("TP53".into()),
                ],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_parse_missing_tokens() {
        for token in ["", "NA", "nan", "null"] {
            assert!(Variable::parse(token, true).is_missing());
            assert!(Variable::parse(token, false).is_missing());
        }
        assert_eq!(Variable::parse(" 2.5 ", true), Variable::Continuous(2.5));
        assert_eq!(
            Variable::parse("A01", false),
            Variable::Categorical("A01".into())
        );
    }

    #[test]
    fn test_integral_display() {
        assert_eq!(Variable::Continuous(1.0).to_string(), "1");
        assert_eq!(Variable::Continuous(1.5).to_string(), "1.5");
        assert_eq!(Variable::Missing.key(), None);
    }

    #[test]
    fn test_levels_skip_missing() {
        let meta = create_test_metadata();
        assert_eq!(meta.levels("gene").unwrap(), vec!["TP53", "nontargeting"]);
        assert_eq!(meta.levels("plate").unwrap(), vec!["1", "2"]);
    }

    #[test]
    fn test_with_column_and_subset() {
        let meta = create_test_metadata();
        let flags = vec![
            Variable::Boolean(true),
            Variable::Boolean(false),
            Variable::Boolean(false),
        ];
        let extended = meta.with_column("is_control", flags).unwrap();
        assert_eq!(extended.n_columns(), 3);
        assert_eq!(meta.n_columns(), 2);

        let subset = extended.subset_rows(&[2, 0]);
        assert_eq!(subset.n_rows(), 2);
        assert_eq!(subset.get(0, "gene").unwrap().as_categorical(), Some("TP53"));
        assert_eq!(subset.get(1, "is_control").unwrap().as_bool(), Some(true));
    }

    #[test]
    fn test_require_columns_reports_all() {
        let meta = create_test_metadata();
        match meta.require_columns(&["plate", "well", "tile"]) {
            Err(OpsError::Schema { columns, .. }) => assert_eq!(columns, vec!["well", "tile"]),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_ragged_columns_rejected() {
        let result = CellMetadata::from_columns(
            vec!["a".into(), "b".into()],
            vec![vec![Variable::Missing], vec![]],
        );
        assert!(result.is_err());
    }
}
