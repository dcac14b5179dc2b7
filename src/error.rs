//! Error types for the ops-aggregate library.

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum OpsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Delimited file parsing error: {0}")]
    Csv(#[from] csv::Error),

    /// Expected column(s) absent from an input table, or a column of the wrong kind.
    #[error("Schema error: column(s) {}: {reason}", .columns.join(", "))]
    Schema { columns: Vec<String>, reason: String },

    /// A configuration value is structurally invalid.
    #[error("Invalid configuration for '{parameter}': {value}")]
    Config { parameter: String, value: String },

    /// A numeric precondition of the alignment stages is violated.
    #[error("Alignment precondition violated: {0}")]
    AlignmentPrecondition(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// A pipeline step failed; `source` keeps the original error kind.
    #[error("Step {index} ({step}) failed: {source}")]
    Step {
        index: usize,
        step: String,
        #[source]
        source: Box<OpsError>,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OpsError {
    /// Schema error for columns absent from a table.
    pub fn missing_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        OpsError::Schema {
            columns: columns.into_iter().map(Into::into).collect(),
            reason: "not present in table".to_string(),
        }
    }

    /// Config error naming the offending parameter and value.
    pub fn config(parameter: &str, value: impl std::fmt::Display) -> Self {
        OpsError::Config {
            parameter: parameter.to_string(),
            value: value.to_string(),
        }
    }

    /// The innermost error, looking through pipeline step wrappers.
    pub fn root(&self) -> &OpsError {
        match self {
            OpsError::Step { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, OpsError>;
