//! Cell classification into phenotype classes.

use crate::data::{CellMetadata, FeatureMatrix, Variable};
use crate::error::{OpsError, Result};
use crate::filter::expr::Query;
use crate::filter::stats::{check_aligned, RowResolver};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Column receiving the assigned class.
pub const CLASS_COL: &str = "class";
/// Column receiving the classifier confidence.
pub const CONFIDENCE_COL: &str = "confidence";

/// Assigns each cell a class and a confidence.
pub trait CellClassifier {
    /// Return the metadata with `class` and `confidence` columns added.
    ///
    /// Features pass through unchanged.
    fn classify(
        &self,
        metadata: &CellMetadata,
        features: &FeatureMatrix,
    ) -> Result<(CellMetadata, FeatureMatrix)>;
}

/// One classification rule as written in a rules file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRule {
    pub class: String,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleFile {
    rules: Vec<ClassRule>,
    #[serde(default = "default_class")]
    default_class: String,
}

fn default_class() -> String {
    "unassigned".to_string()
}

/// First-match rule classifier.
///
/// Rules are tried in order; the first whose query holds assigns its class
/// with confidence 1.0. Cells matching no rule get the default class with
/// confidence 0.0.
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    rules: Vec<(String, Query)>,
    default_class: String,
}

impl RuleClassifier {
    /// Build from `(class, query)` pairs.
    pub fn new(rules: &[ClassRule], default_class: impl Into<String>) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|r| Ok((r.class.clone(), Query::parse(&r.query)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            default_class: default_class.into(),
        })
    }

    /// Parse a YAML rules document:
    ///
    /// ```yaml
    /// rules:
    ///   - class: mitotic
    ///     query: "nucleus_DAPI_mean_intensity > 3000"
    /// default_class: interphase
    /// ```
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RuleFile = serde_yaml::from_str(yaml)?;
        if file.rules.is_empty() {
            return Err(OpsError::config("classifier_path", "no rules defined"));
        }
        Self::new(&file.rules, file.default_class)
    }

    /// Load a YAML rules file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Class names in rule order, followed by the default class.
    pub fn classes(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for name in self
            .rules
            .iter()
            .map(|(c, _)| c.as_str())
            .chain(std::iter::once(self.default_class.as_str()))
        {
            if !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }
}

impl CellClassifier for RuleClassifier {
    fn classify(
        &self,
        metadata: &CellMetadata,
        features: &FeatureMatrix,
    ) -> Result<(CellMetadata, FeatureMatrix)> {
        check_aligned(metadata, features)?;
        let columns: Vec<&str> = self.rules.iter().flat_map(|(_, q)| q.columns()).collect();
        let resolver = RowResolver::new(metadata, features, &columns)?;

        let assigned: Vec<(Variable, Variable)> = (0..features.n_cells())
            .into_par_iter()
            .map(|row| {
                let lookup = |name: &str| resolver.value(row, name);
                match self.rules.iter().find(|(_, q)| q.matches(&lookup)) {
                    Some((class, _)) => (
                        Variable::Categorical(class.clone()),
                        Variable::Continuous(1.0),
                    ),
                    None => (
                        Variable::Categorical(self.default_class.clone()),
                        Variable::Continuous(0.0),
                    ),
                }
            })
            .collect();
        let (classes, confidence): (Vec<_>, Vec<_>) = assigned.into_iter().unzip();

        let n_default = classes
            .iter()
            .filter(|c| c.as_categorical() == Some(self.default_class.as_str()))
            .count();
        log::info!(
            "Classified {} cells ({} assigned the default class '{}')",
            classes.len(),
            n_default,
            self.default_class
        );

        let metadata = metadata
            .with_column(CLASS_COL, classes)?
            .with_column(CONFIDENCE_COL, confidence)?;
        Ok((metadata, features.clone()))
    }
}
