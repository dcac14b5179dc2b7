//! Work-unit enumeration.
//!
//! A full screen is aggregated in independent units of plate × well × cell
//! class × channel combination. Units are enumerated from the observed
//! plate/well pairs and persisted as TSV so they can be dispatched
//! separately.

use crate::data::CellMetadata;
use crate::error::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Separator between channel names in a rendered channel combination.
pub const CHANNEL_SEPARATOR: &str = "_";

const HEADER: [&str; 4] = ["plate", "well", "cell_class", "channel_combo"];

/// One unit of aggregation work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateCombo {
    pub plate: String,
    pub well: String,
    pub cell_class: String,
    pub channel_combo: Vec<String>,
}

impl AggregateCombo {
    /// Channel combination rendered as `DAPI_COXIV`.
    pub fn channel_combo_label(&self) -> String {
        self.channel_combo.join(CHANNEL_SEPARATOR)
    }

    /// File name stem identifying this unit, e.g. `P-1_W-A1_CeCl-all_ChCo-DAPI_COXIV`.
    pub fn output_stem(&self) -> String {
        format!(
            "P-{}_W-{}_CeCl-{}_ChCo-{}",
            self.plate,
            self.well,
            self.cell_class,
            self.channel_combo_label()
        )
    }
}

/// Enumerate units for every observed plate/well pair.
///
/// Output is sorted by plate, well, cell class, then channel combination.
pub fn enumerate_combos(
    metadata: &CellMetadata,
    plate_col: &str,
    well_col: &str,
    cell_classes: &[String],
    channel_combos: &[Vec<String>],
) -> Result<Vec<AggregateCombo>> {
    if cell_classes.is_empty() {
        return Err(OpsError::config("cell_classes", "at least one class is required"));
    }
    if channel_combos.is_empty() || channel_combos.iter().any(Vec::is_empty) {
        return Err(OpsError::config(
            "channel_combos",
            "every combination needs at least one channel",
        ));
    }
    if let Some(bad) = channel_combos
        .iter()
        .flatten()
        .find(|c| c.contains(CHANNEL_SEPARATOR))
    {
        return Err(OpsError::config(
            "channel_combos",
            format!("channel name '{}' contains '{}'", bad, CHANNEL_SEPARATOR),
        ));
    }
    metadata.require_columns(&[plate_col, well_col])?;
    let plates = metadata.column(plate_col)?;
    let wells = metadata.column(well_col)?;

    let pairs: BTreeSet<(String, String)> = plates
        .iter()
        .zip(wells)
        .filter_map(|(p, w)| Some((p.key()?, w.key()?)))
        .collect();

    let mut combos = BTreeSet::new();
    for (plate, well) in &pairs {
        for class in cell_classes {
            for channels in channel_combos {
                combos.insert(AggregateCombo {
                    plate: plate.clone(),
                    well: well.clone(),
                    cell_class: class.clone(),
                    channel_combo: channels.clone(),
                });
            }
        }
    }
    log::info!(
        "Enumerated {} work units over {} plate/well pairs",
        combos.len(),
        pairs.len()
    );
    Ok(combos.into_iter().collect())
}

/// Write units as TSV with columns `plate`, `well`, `cell_class`, `channel_combo`.
pub fn combos_to_tsv<P: AsRef<Path>>(combos: &[AggregateCombo], path: P) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    writer.write_record(HEADER)?;
    for c in combos {
        writer.write_record([
            c.plate.as_str(),
            c.well.as_str(),
            c.cell_class.as_str(),
            c.channel_combo_label().as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Read units written by [`combos_to_tsv`]. Extra columns are ignored.
pub fn combos_from_tsv<P: AsRef<Path>>(path: P) -> Result<Vec<AggregateCombo>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let missing: Vec<&str> = HEADER
        .iter()
        .copied()
        .filter(|h| !headers.iter().any(|c| c == *h))
        .collect();
    if !missing.is_empty() {
        return Err(OpsError::missing_columns(missing));
    }
    let idx = |name: &str| headers.iter().position(|c| c == name).unwrap_or(0);
    let (plate, well, class, combo) = (
        idx("plate"),
        idx("well"),
        idx("cell_class"),
        idx("channel_combo"),
    );

    let mut combos = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("").to_string();
        combos.push(AggregateCombo {
            plate: field(plate),
            well: field(well),
            cell_class: field(class),
            channel_combo: field(combo)
                .split(CHANNEL_SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        });
    }
    Ok(combos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Variable;
    use tempfile::NamedTempFile;

    fn create_metadata() -> CellMetadata {
        CellMetadata::from_columns(
            vec!["plate".into(), "well".into()],
            vec![
                vec![
                    Variable::Ordinal(2),
                    Variable::Ordinal(1),
                    Variable::Ordinal(1),
                    Variable::Missing,
                ],
                vec![
                    Variable::Categorical("A1".into()),
                    Variable::Categorical("B2".into()),
                    Variable::Categorical("B2".into()),
                    Variable::Categorical("C3".into()),
                ],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_enumerate_sorted_and_unique() {
        let meta = create_metadata();
        let combos = enumerate_combos(
            &meta,
            "plate",
            "well",
            &["all".into(), "mitotic".into()],
            &[vec!["DAPI".into()], vec!["DAPI".into(), "COXIV".into()]],
        )
        .unwrap();
        // 2 plate/well pairs × 2 classes × 2 combos
        assert_eq!(combos.len(), 8);
        assert_eq!(combos[0].plate, "1");
        assert_eq!(combos[0].well, "B2");
        assert_eq!(
            combos[0].output_stem(),
            "P-1_W-B2_CeCl-all_ChCo-DAPI"
        );
    }

    #[test]
    fn test_tsv_round_trip() {
        let meta = create_metadata();
        let combos = enumerate_combos(
            &meta,
            "plate",
            "well",
            &["all".into()],
            &[vec!["DAPI".into(), "COXIV".into()]],
        )
        .unwrap();
        let file = NamedTempFile::new().unwrap();
        combos_to_tsv(&combos, file.path()).unwrap();
        assert_eq!(combos_from_tsv(file.path()).unwrap(), combos);
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let meta = create_metadata();
        assert!(enumerate_combos(&meta, "plate", "well", &[], &[vec!["DAPI".into()]]).is_err());
        assert!(enumerate_combos(&meta, "plate", "well", &["all".into()], &[vec![]]).is_err());
        assert!(matches!(
            enumerate_combos(&meta, "tile", "well", &["all".into()], &[vec!["DAPI".into()]]),
            Err(OpsError::Schema { .. })
        ));
    }
}
