//! Aggregated per-perturbation profiles.

use crate::data::Variable;
use crate::error::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One aggregated profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// Group identity (perturbation, or control guide when controls are split).
    pub perturbation: String,
    /// Aggregated value per dimension.
    pub features: Vec<f64>,
    /// Number of cells in the group.
    pub cell_count: usize,
    /// First observed value of each collapse column, in table order.
    pub collapsed: Vec<Variable>,
}

/// Collection of aggregated profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateTable {
    /// Names of the aggregated dimensions.
    pub feature_names: Vec<String>,
    /// Metadata columns carried through aggregation.
    pub collapse_cols: Vec<String>,
    pub records: Vec<AggregateRecord>,
}

impl AggregateTable {
    /// Create a table, checking every record against the column layout.
    pub fn new(
        feature_names: Vec<String>,
        collapse_cols: Vec<String>,
        records: Vec<AggregateRecord>,
    ) -> Result<Self> {
        for r in &records {
            if r.features.len() != feature_names.len() {
                return Err(OpsError::DimensionMismatch {
                    expected: feature_names.len(),
                    actual: r.features.len(),
                });
            }
            if r.collapsed.len() != collapse_cols.len() {
                return Err(OpsError::DimensionMismatch {
                    expected: collapse_cols.len(),
                    actual: r.collapsed.len(),
                });
            }
        }
        Ok(Self {
            feature_names,
            collapse_cols,
            records,
        })
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total cells across all records.
    pub fn total_cells(&self) -> usize {
        self.records.iter().map(|r| r.cell_count).sum()
    }

    /// Look up a record by group name.
    pub fn get(&self, perturbation: &str) -> Option<&AggregateRecord> {
        self.records.iter().find(|r| r.perturbation == perturbation)
    }

    /// Iterate over records.
    pub fn iter(&self) -> impl Iterator<Item = &AggregateRecord> {
        self.records.iter()
    }

    /// Sort by cell count, largest first. Ties keep their current order.
    pub fn sort_by_cell_count(&mut self) {
        self.records.sort_by(|a, b| b.cell_count.cmp(&a.cell_count));
    }

    /// Write to TSV: `perturbation`, `cell_count`, collapse columns, then features.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;

        let mut header = vec!["perturbation".to_string(), "cell_count".to_string()];
        header.extend(self.collapse_cols.iter().cloned());
        header.extend(self.feature_names.iter().cloned());
        writer.write_record(&header)?;

        for r in &self.records {
            let mut fields = vec![r.perturbation.clone(), r.cell_count.to_string()];
            fields.extend(r.collapsed.iter().map(|v| v.to_string()));
            fields.extend(r.features.iter().map(|v| v.to_string()));
            writer.write_record(&fields)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write pretty JSON to a file.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl std::fmt::Display for AggregateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Aggregated profiles")?;
        writeln!(f, "  Groups:     {}", self.len())?;
        writeln!(f, "  Cells:      {}", self.total_cells())?;
        writeln!(f, "  Dimensions: {}", self.feature_names.len())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CellTable;
    use tempfile::NamedTempFile;

    fn create_table() -> AggregateTable {
        AggregateTable::new(
            vec!["PC_0".into(), "PC_1".into()],
            vec!["gene_id".into()],
            vec![
                AggregateRecord {
                    perturbation: "KRAS".into(),
                    features: vec![0.5, -1.25],
                    cell_count: 3,
                    collapsed: vec![Variable::Ordinal(3845)],
                },
                AggregateRecord {
                    perturbation: "TP53".into(),
                    features: vec![2.0, 0.0],
                    cell_count: 12,
                    collapsed: vec![Variable::Ordinal(7157)],
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_sort_by_cell_count() {
        let mut table = create_table();
        table.sort_by_cell_count();
        assert_eq!(table.records[0].perturbation, "TP53");
        assert_eq!(table.total_cells(), 15);
    }

    #[test]
    fn test_to_tsv() {
        let table = create_table();
        let file = NamedTempFile::new().unwrap();
        table.to_tsv(file.path()).unwrap();

        let loaded = CellTable::from_tsv(file.path()).unwrap();
        assert_eq!(
            loaded.column_names(),
            &["perturbation", "cell_count", "gene_id", "PC_0", "PC_1"]
        );
        assert_eq!(loaded.n_rows(), 2);
        let (meta, feats) = loaded
            .split(&["perturbation".to_string(), "cell_count".to_string(), "gene_id".to_string()])
            .unwrap();
        assert_eq!(meta.get(0, "perturbation"), Some(&Variable::Categorical("KRAS".into())));
        assert_eq!(feats.get(0, 1), -1.25);
    }

    #[test]
    fn test_to_tsv_quotes_delimiters() {
        let mut table = create_table();
        table.records[0].perturbation = "KRAS\tG12D".into();
        let file = NamedTempFile::new().unwrap();
        table.to_tsv(file.path()).unwrap();

        let loaded = CellTable::from_tsv(file.path()).unwrap();
        assert_eq!(loaded.n_rows(), 2);
        let (meta, feats) = loaded
            .split(&["perturbation".to_string(), "cell_count".to_string(), "gene_id".to_string()])
            .unwrap();
        assert_eq!(
            meta.get(0, "perturbation"),
            Some(&Variable::Categorical("KRAS\tG12D".into()))
        );
        assert_eq!(feats.n_features(), 2);
        assert_eq!(feats.get(0, 1), -1.25);
    }

    #[test]
    fn test_json() {
        let table = create_table();
        let json = table.to_json().unwrap();
        let back: AggregateTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_layout_checked() {
        let result = AggregateTable::new(
            vec!["PC_0".into()],
            Vec::new(),
            vec![AggregateRecord {
                perturbation: "x".into(),
                features: vec![1.0, 2.0],
                cell_count: 1,
                collapsed: Vec::new(),
            }],
        );
        assert!(result.is_err());
    }
}
