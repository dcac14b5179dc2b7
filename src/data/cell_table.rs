//! Raw per-cell tables and the metadata/feature split.

use crate::data::features::FeatureMatrix;
use crate::data::metadata::{CellMetadata, Variable, MISSING_TOKENS};
use crate::error::{OpsError, Result};
use log::{debug, info};
use nalgebra::DMatrix;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

/// A per-cell table as read from disk: one row per cell, metadata and
/// feature columns not yet separated.
#[derive(Debug, Clone)]
pub struct CellTable {
    column_names: Vec<String>,
    columns: Vec<Vec<Variable>>,
    n_rows: usize,
}

impl CellTable {
    /// Build a table from named columns of equal length.
    pub fn from_columns(column_names: Vec<String>, columns: Vec<Vec<Variable>>) -> Result<Self> {
        if column_names.len() != columns.len() {
            return Err(OpsError::DimensionMismatch {
                expected: column_names.len(),
                actual: columns.len(),
            });
        }
        let n_rows = columns.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = columns.iter().find(|c| c.len() != n_rows) {
            return Err(OpsError::DimensionMismatch {
                expected: n_rows,
                actual: bad.len(),
            });
        }
        Ok(Self {
            column_names,
            columns,
            n_rows,
        })
    }

    /// Load a tab-separated table.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_delimited(path, b'\t', None)
    }

    /// Load a delimited table, optionally keeping only the first `max_rows` rows.
    ///
    /// Column types are inferred: a column is boolean if every non-missing
    /// value is `True`/`False`, numeric if every one parses as a number,
    /// otherwise categorical. Numeric fields written as integers load as
    /// [`Variable::Ordinal`], the rest as [`Variable::Continuous`].
    pub fn from_delimited<P: AsRef<Path>>(
        path: P,
        delimiter: u8,
        max_rows: Option<usize>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_path(path)?;

        let column_names: Vec<String> = reader.headers()?.iter().map(String::from).collect();
        if column_names.is_empty() {
            return Err(OpsError::EmptyData(format!(
                "No columns in {}",
                path.display()
            )));
        }

        let limit = max_rows.unwrap_or(usize::MAX);
        let mut raw: Vec<Vec<String>> = vec![Vec::new(); column_names.len()];
        for record in reader.records().take(limit) {
            let record = record?;
            for (col, field) in record.iter().enumerate() {
                raw[col].push(field.to_string());
            }
        }

        let columns: Vec<Vec<Variable>> = raw
            .into_iter()
            .map(|values| {
                let present = || {
                    values
                        .iter()
                        .map(|v| v.trim())
                        .filter(|v| !MISSING_TOKENS.contains(v))
                };
                if present().next().is_some() && present().all(|v| parse_bool(v).is_some()) {
                    return values
                        .iter()
                        .map(|v| parse_bool(v.trim()).map_or(Variable::Missing, Variable::Boolean))
                        .collect();
                }
                if present().next().is_some() && present().all(|v| v.parse::<i64>().is_ok()) {
                    return values
                        .iter()
                        .map(|v| v.trim().parse().map_or(Variable::Missing, Variable::Ordinal))
                        .collect();
                }
                let numeric = present().all(|v| v.parse::<f64>().is_ok());
                values.iter().map(|v| Variable::parse(v, numeric)).collect()
            })
            .collect();

        let table = Self::from_columns(column_names, columns)?;
        info!(
            "Loaded {} cells × {} columns from {}",
            table.n_rows(),
            table.n_columns(),
            path.display()
        );
        Ok(table)
    }

    /// Write the table as TSV.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        writer.write_record(&self.column_names)?;
        for row in 0..self.n_rows {
            writer.write_record(self.columns.iter().map(|col| col[row].to_string()))?;
        }
        writer.flush()?;
        Ok(())
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

    /// Split into metadata and features.
    ///
    /// Metadata columns appear in the order listed; every other column is a
    /// feature, kept in input order. Rows keep their input order in both halves.
    pub fn split(&self, metadata_cols: &[String]) -> Result<(CellMetadata, FeatureMatrix)> {
        let missing: Vec<&String> = metadata_cols
            .iter()
            .filter(|c| !self.column_names.contains(c))
            .collect();
        if !missing.is_empty() {
            return Err(OpsError::missing_columns(missing.into_iter().cloned()));
        }

        let mut seen = HashSet::new();
        let mut meta_names = Vec::new();
        let mut meta_columns = Vec::new();
        for name in metadata_cols {
            if !seen.insert(name.as_str()) {
                continue;
            }
            if let Some(idx) = self.column_names.iter().position(|c| c == name) {
                meta_names.push(name.clone());
                meta_columns.push(self.columns[idx].clone());
            }
        }
        let metadata = if meta_names.is_empty() {
            CellMetadata::with_rows(self.n_rows)
        } else {
            CellMetadata::from_columns(meta_names, meta_columns)?
        };

        let feature_idx: Vec<usize> = (0..self.n_columns())
            .filter(|&i| !seen.contains(self.column_names[i].as_str()))
            .collect();
        for &j in &feature_idx {
            if self.columns[j].iter().any(|v| v.as_categorical().is_some()) {
                return Err(OpsError::Schema {
                    columns: vec![self.column_names[j].clone()],
                    reason: "feature column holds non-numeric values".to_string(),
                });
            }
        }
        let data = DMatrix::from_fn(self.n_rows, feature_idx.len(), |i, j| {
            self.columns[feature_idx[j]][i]
                .as_continuous()
                .unwrap_or(f64::NAN)
        });
        let names = feature_idx
            .iter()
            .map(|&j| self.column_names[j].clone())
            .collect();
        let features = FeatureMatrix::new(data, names)?;

        debug!(
            "Split {} columns into {} metadata and {} features",
            self.n_columns(),
            metadata.n_columns(),
            features.n_features()
        );
        Ok((metadata, features))
    }

    /// Rejoin metadata and features: metadata columns first, then features.
    pub fn from_parts(metadata: &CellMetadata, features: &FeatureMatrix) -> Result<Self> {
        if metadata.n_rows() != features.n_cells() {
            return Err(OpsError::DimensionMismatch {
                expected: features.n_cells(),
                actual: metadata.n_rows(),
            });
        }
        let mut column_names = metadata.column_names().to_vec();
        let mut columns: Vec<Vec<Variable>> = (0..metadata.n_columns())
            .map(|j| metadata.column_at(j).to_vec())
            .collect();
        for (j, name) in features.feature_names().iter().enumerate() {
            column_names.push(name.clone());
            columns.push(
                features
                    .matrix()
                    .column(j)
                    .iter()
                    .map(|&v| {
                        if v.is_nan() {
                            Variable::Missing
                        } else {
                            Variable::Continuous(v)
                        }
                    })
                    .collect(),
            );
        }
        let mut table = Self::from_columns(column_names, columns)?;
        table.n_rows = features.n_cells();
        Ok(table)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "True" | "true" | "TRUE" => Some(true),
        "False" | "false" | "FALSE" => Some(false),
        _ => None,
    }
}

/// Read the metadata column list from a newline- or tab-delimited file.
pub fn load_metadata_cols<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    let mut seen = HashSet::new();
    let cols: Vec<String> = contents
        .split(['\n', '\t', '\r'])
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .filter(|c| seen.insert(c.to_string()))
        .map(String::from)
        .collect();
    if cols.is_empty() {
        return Err(OpsError::EmptyData("metadata column list is empty".to_string()));
    }
    Ok(cols)
}

/// Write a metadata column list, one name per line.
pub fn save_metadata_cols<P: AsRef<Path>>(path: P, cols: &[String]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    for col in cols {
        writeln!(file, "{}", col)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_tsv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "plate\twell\tcell_area\tgene_symbol\tdapi_intensity").unwrap();
        writeln!(file, "1\tA1\t120.5\tnontargeting\t0.8").unwrap();
        writeln!(file, "1\tA1\t98.0\tTP53\tNA").unwrap();
        writeln!(file, "2\tB3\t101.2\t\t0.6").unwrap();
        file.flush().unwrap();
        file
    }

    fn metadata_cols() -> Vec<String> {
        vec!["plate".into(), "well".into(), "gene_symbol".into()]
    }

    #[test]
    fn test_load_and_infer_types() {
        let file = create_test_tsv();
        let table = CellTable::from_tsv(file.path()).unwrap();
        assert_eq!(table.n_rows(), 3);
        assert_eq!(table.n_columns(), 5);
    }

    #[test]
    fn test_infers_boolean_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "mapped_single_gene\tcell_area").unwrap();
        writeln!(file, "True\t1.0").unwrap();
        writeln!(file, "False\t2.0").unwrap();
        writeln!(file, "NA\t3.0").unwrap();
        file.flush().unwrap();
        let table = CellTable::from_tsv(file.path()).unwrap();
        let (meta, _) = table.split(&["mapped_single_gene".to_string()]).unwrap();
        let flags = meta.column("mapped_single_gene").unwrap();
        assert_eq!(flags[0], Variable::Boolean(true));
        assert_eq!(flags[1], Variable::Boolean(false));
        assert!(flags[2].is_missing());
    }

    #[test]
    fn test_infers_integer_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "plate\ttile\tcell_area").unwrap();
        writeln!(file, "1\t3\t1.5").unwrap();
        writeln!(file, "2\tNA\t2").unwrap();
        file.flush().unwrap();
        let table = CellTable::from_tsv(file.path()).unwrap();
        let (meta, feats) = table
            .split(&["plate".to_string(), "tile".to_string()])
            .unwrap();
        assert_eq!(meta.get(0, "plate"), Some(&Variable::Ordinal(1)));
        assert_eq!(meta.get(1, "plate"), Some(&Variable::Ordinal(2)));
        assert_eq!(meta.get(0, "tile"), Some(&Variable::Ordinal(3)));
        assert!(meta.get(1, "tile").unwrap().is_missing());
        // mixed integer and decimal values stay continuous
        assert_eq!(feats.get(1, 0), 2.0);
    }

    #[test]
    fn test_max_rows_preview() {
        let file = create_test_tsv();
        let table = CellTable::from_delimited(file.path(), b'\t', Some(2)).unwrap();
        assert_eq!(table.n_rows(), 2);
    }

    #[test]
    fn test_split_partitions_columns() {
        let file = create_test_tsv();
        let table = CellTable::from_tsv(file.path()).unwrap();
        let (meta, feats) = table.split(&metadata_cols()).unwrap();

        let mut all: Vec<String> = meta.column_names().to_vec();
        all.extend(feats.feature_names().iter().cloned());
        all.sort();
        let mut input = table.column_names().to_vec();
        input.sort();
        assert_eq!(all, input);

        assert_eq!(meta.n_rows(), table.n_rows());
        assert_eq!(feats.n_cells(), table.n_rows());
        assert_eq!(feats.feature_names(), &["cell_area", "dapi_intensity"]);
        assert_eq!(feats.get(2, 0), 101.2);
        assert!(feats.get(1, 1).is_nan());
        assert!(meta.get(2, "gene_symbol").unwrap().is_missing());
        assert_eq!(meta.get(0, "well").unwrap().as_categorical(), Some("A1"));
    }

    #[test]
    fn test_split_missing_column() {
        let file = create_test_tsv();
        let table = CellTable::from_tsv(file.path()).unwrap();
        let cols = vec!["plate".to_string(), "tile".to_string()];
        match table.split(&cols) {
            Err(OpsError::Schema { columns, .. }) => assert_eq!(columns, vec!["tile"]),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_split_rejects_text_feature() {
        let file = create_test_tsv();
        let table = CellTable::from_tsv(file.path()).unwrap();
        let cols = vec!["plate".to_string(), "gene_symbol".to_string()];
        assert!(matches!(table.split(&cols), Err(OpsError::Schema { .. })));
    }

    #[test]
    fn test_tsv_roundtrip() {
        let file = create_test_tsv();
        let table = CellTable::from_tsv(file.path()).unwrap();
        let out = NamedTempFile::new().unwrap();
        table.to_tsv(out.path()).unwrap();
        let reloaded = CellTable::from_tsv(out.path()).unwrap();
        assert_eq!(reloaded.column_names(), table.column_names());
        assert_eq!(reloaded.n_rows(), table.n_rows());
    }

    #[test]
    fn test_from_parts_rejoins_split() {
        let file = create_test_tsv();
        let table = CellTable::from_tsv(file.path()).unwrap();
        let (meta, feats) = table.split(&metadata_cols()).unwrap();
        let joined = CellTable::from_parts(&meta, &feats).unwrap();
        assert_eq!(
            joined.column_names(),
            &["plate", "well", "gene_symbol", "cell_area", "dapi_intensity"]
        );
        let (meta2, feats2) = joined.split(&metadata_cols()).unwrap();
        assert_eq!(meta2, meta);
        assert_eq!(feats2.get(0, 0), feats.get(0, 0));
        assert!(feats2.get(1, 1).is_nan());
    }

    #[test]
    fn test_load_metadata_cols_mixed_delimiters() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "plate\twell\ntile\n\nplate\n").unwrap();
        file.flush().unwrap();
        let cols = load_metadata_cols(file.path()).unwrap();
        assert_eq!(cols, vec!["plate", "well", "tile"]);
    }
}
