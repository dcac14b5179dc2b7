//! Cell filtering primitives.
//!
//! Every filter borrows row-aligned metadata and features and returns a
//! [`Filtered`] value holding the surviving rows and a [`FilterStats`]
//! summary. Filters that remove every row return an empty result rather
//! than an error.

pub mod expr;
pub mod intensity;
pub mod isolation;
pub mod missing;
pub mod perturbation;
pub mod query;
pub mod stats;

pub use expr::{CompareOp, Expr, Literal, Query, Value};
pub use intensity::{filter_intensity, IntensityFilterConfig, DEFAULT_INTENSITY_PATTERN};
pub use isolation::{flag_outliers, IsolationForest, IsolationForestConfig};
pub use missing::{filter_missing, impute, ImputeMethod, MissingValueConfig};
pub use perturbation::{filter_perturbation, PerturbationFiltered};
pub use query::{filter_parsed, filter_queries};
pub use stats::{FilterStats, Filtered};
