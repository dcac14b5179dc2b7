//! Aggregation run configuration.

use crate::aggregate::{AggMethod, AggregateOptions};
use crate::align::CONTROL_ID_COL;
use crate::data::load_metadata_cols;
use crate::embed::{PcaConfig, VarianceOrNcomp, DEFAULT_SAMPLE_CAP};
use crate::error::{OpsError, Result};
use crate::filter::{
    ImputeMethod, IntensityFilterConfig, IsolationForestConfig, MissingValueConfig, Query,
    DEFAULT_INTENSITY_PATTERN,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Parameters of one aggregation run.
///
/// Missing YAML keys take their default values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    /// File listing metadata column names, one per line or tab-separated.
    pub metadata_cols_fp: Option<PathBuf>,
    /// Metadata column names given inline; used when `metadata_cols_fp` is absent.
    pub metadata_cols: Vec<String>,
    /// Metadata columns carried through aggregation.
    pub collapse_cols: Vec<String>,
    /// YAML rules file for the cell classifier.
    pub classifier_path: Option<PathBuf>,
    /// TSV of work units to run.
    pub aggregate_combo_fp: Option<PathBuf>,
    /// Row queries applied before any other filter.
    pub filter_queries: Vec<String>,
    pub perturbation_name_col: String,
    pub drop_cols_threshold: f64,
    pub drop_rows_threshold: f64,
    pub impute: bool,
    pub impute_method: ImputeMethod,
    /// Fraction of cells flagged as intensity outliers, in [0, 1).
    pub contamination: f64,
    /// Acquired channels; enables per-channel outlier detection and channel subsetting.
    pub channel_names: Option<Vec<String>>,
    pub intensity_pattern: String,
    pub batch_cols: Vec<String>,
    pub control_key: String,
    /// Guide-level identity column; when set, controls are aggregated per guide.
    pub perturbation_id_col: Option<String>,
    pub variance_or_ncomp: VarianceOrNcomp,
    pub num_align_batches: usize,
    pub agg_method: AggMethod,
    pub sort_by_cell_count: bool,
    pub plate_col: String,
    pub well_col: String,
    pub seed: u64,
    pub pca_sample_cap: usize,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            metadata_cols_fp: None,
            metadata_cols: Vec::new(),
            collapse_cols: Vec::new(),
            classifier_path: None,
            aggregate_combo_fp: None,
            filter_queries: Vec::new(),
            perturbation_name_col: "gene_symbol_0".to_string(),
            drop_cols_threshold: 0.1,
            drop_rows_threshold: 0.01,
            impute: true,
            impute_method: ImputeMethod::Median,
            contamination: 0.01,
            channel_names: None,
            intensity_pattern: DEFAULT_INTENSITY_PATTERN.to_string(),
            batch_cols: vec!["plate".to_string(), "well".to_string()],
            control_key: "nontargeting".to_string(),
            perturbation_id_col: None,
            variance_or_ncomp: VarianceOrNcomp::Variance(0.95),
            num_align_batches: 1,
            agg_method: AggMethod::Mean,
            sort_by_cell_count: false,
            plate_col: "plate".to_string(),
            well_col: "well".to_string(),
            seed: 42,
            pca_sample_cap: DEFAULT_SAMPLE_CAP,
        }
    }
}

impl AggregateConfig {
    /// Load from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(OpsError::from)
    }

    /// Save to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(OpsError::from)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Write to a YAML file.
    pub fn to_yaml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Check every parameter, reporting the first offending one.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("drop_cols_threshold", self.drop_cols_threshold),
            ("drop_rows_threshold", self.drop_rows_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(OpsError::config(name, value));
            }
        }
        if !(0.0..1.0).contains(&self.contamination) {
            return Err(OpsError::config("contamination", self.contamination));
        }
        for (name, value) in [
            ("perturbation_name_col", &self.perturbation_name_col),
            ("control_key", &self.control_key),
        ] {
            if value.trim().is_empty() {
                return Err(OpsError::config(name, "must not be empty"));
            }
        }
        if self.batch_cols.is_empty() {
            return Err(OpsError::config("batch_cols", "at least one column is required"));
        }
        match self.variance_or_ncomp {
            VarianceOrNcomp::Variance(f) if !(f > 0.0 && f < 1.0) => {
                return Err(OpsError::config("variance_or_ncomp", f));
            }
            VarianceOrNcomp::Components(0) => {
                return Err(OpsError::config("variance_or_ncomp", 0));
            }
            _ => {}
        }
        if self.num_align_batches == 0 {
            return Err(OpsError::config("num_align_batches", 0));
        }
        if self.pca_sample_cap < 2 {
            return Err(OpsError::config("pca_sample_cap", self.pca_sample_cap));
        }
        if let Some(channels) = &self.channel_names {
            if channels.is_empty() || channels.iter().any(|c| c.trim().is_empty()) {
                return Err(OpsError::config("channel_names", "empty channel name"));
            }
        }
        if let Err(e) = regex::Regex::new(&self.intensity_pattern) {
            return Err(OpsError::config("intensity_pattern", e));
        }
        for q in &self.filter_queries {
            Query::parse(q)?;
        }
        Ok(())
    }

    /// Metadata column names, read from `metadata_cols_fp` when set.
    pub fn resolve_metadata_cols(&self) -> Result<Vec<String>> {
        let cols = match &self.metadata_cols_fp {
            Some(path) => load_metadata_cols(path)?,
            None => self.metadata_cols.clone(),
        };
        if cols.is_empty() {
            return Err(OpsError::config(
                "metadata_cols_fp",
                "no metadata columns configured",
            ));
        }
        Ok(cols)
    }

    pub fn missing_value_config(&self) -> MissingValueConfig {
        MissingValueConfig {
            drop_cols_threshold: self.drop_cols_threshold,
            drop_rows_threshold: self.drop_rows_threshold,
            impute: self.impute,
            method: self.impute_method,
        }
    }

    pub fn intensity_config(&self) -> IntensityFilterConfig {
        IntensityFilterConfig {
            contamination: self.contamination,
            channel_names: self.channel_names.clone(),
            intensity_pattern: self.intensity_pattern.clone(),
            forest: IsolationForestConfig {
                seed: self.seed,
                ..Default::default()
            },
        }
    }

    pub fn pca_config(&self) -> PcaConfig {
        PcaConfig {
            variance_or_ncomp: self.variance_or_ncomp,
            num_align_batches: self.num_align_batches,
            sample_cap: self.pca_sample_cap,
            seed: self.seed,
        }
    }

    /// Controls are split by guide whenever `perturbation_id_col` is set.
    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            split_controls: self.perturbation_id_col.is_some(),
            collapse_cols: self
                .collapse_cols
                .iter()
                .filter(|c| c.as_str() != CONTROL_ID_COL)
                .cloned()
                .collect(),
            feature_names: None,
            sort_by_cell_count: self.sort_by_cell_count,
        }
    }
}
