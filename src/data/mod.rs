//! Data structures for per-cell feature tables.

mod cell_table;
mod features;
mod metadata;

pub use cell_table::{load_metadata_cols, save_metadata_cols, CellTable};
pub use features::FeatureMatrix;
pub use metadata::{CellMetadata, Variable};
