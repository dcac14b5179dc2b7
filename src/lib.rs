//! Feature Alignment and Aggregation for Optical Pooled Screens
//!
//! This library turns per-cell feature tables from optical pooled screening
//! into batch-corrected, per-perturbation profiles.
//!
//! # Overview
//!
//! The library is organized into composable modules:
//!
//! - **data**: Core data structures (CellTable, CellMetadata, FeatureMatrix)
//! - **filter**: Cell filtering (queries, perturbation, missing values, intensity outliers)
//! - **align**: Batch and control annotation
//! - **embed**: Shared PCA embedding
//! - **normalize**: Typical variation normalization (TVN) against controls
//! - **aggregate**: Per-perturbation aggregation
//! - **capability**: Cell classification and channel subsetting
//! - **combo**: Plate/well/class/channel work units
//! - **pipeline**: Pipeline composition and execution
//!
//! # Example
//!
//! ```no_run
//! use ops_aggregate::prelude::*;
//!
//! let table = CellTable::from_tsv("cells.tsv").unwrap();
//! let metadata_cols = load_metadata_cols("metadata_cols.tsv").unwrap();
//!
//! let batch_cols = vec!["plate".to_string(), "well".to_string()];
//!
//! let output = Pipeline::new()
//!     .filter_queries(&["mapped_single_gene == True"])
//!     .filter_perturbation("gene_symbol_0")
//!     .filter_missing(MissingValueConfig::default())
//!     .filter_intensity(IntensityFilterConfig::default())
//!     .prepare_alignment(&batch_cols, "gene_symbol_0", "nontargeting", None)
//!     .embed_pca(PcaConfig::default())
//!     .normalize_tvn("gene_symbol_0", "nontargeting")
//!     .aggregate("gene_symbol_0", AggMethod::Mean, AggregateOptions::default())
//!     .run_table(&table, &metadata_cols)
//!     .unwrap();
//!
//! output.table.to_tsv("aggregated.tsv").unwrap();
//! ```

pub mod aggregate;
pub mod align;
pub mod capability;
pub mod combo;
pub mod data;
pub mod embed;
pub mod error;
pub mod filter;
pub mod normalize;
pub mod pipeline;

mod linalg;
mod stats;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::aggregate::{aggregate, AggMethod, AggregateOptions, AggregateRecord, AggregateTable};
    pub use crate::align::{prepare_alignment_data, BATCH_VALUES_COL, CONTROL_ID_COL, IS_CONTROL_COL};
    pub use crate::capability::{
        CellClassifier, ChannelSubsetter, ClassRule, NameChannelSubsetter, RuleClassifier,
    };
    pub use crate::combo::{combos_from_tsv, combos_to_tsv, enumerate_combos, AggregateCombo};
    pub use crate::data::{
        load_metadata_cols, save_metadata_cols, CellMetadata, CellTable, FeatureMatrix, Variable,
    };
    pub use crate::embed::{embed_by_pca, PcaBasis, PcaConfig, PcaEmbedding, VarianceOrNcomp};
    pub use crate::error::{OpsError, Result};
    pub use crate::filter::{
        filter_intensity, filter_missing, filter_perturbation, filter_queries, FilterStats,
        Filtered, ImputeMethod, IntensityFilterConfig, MissingValueConfig, Query,
    };
    pub use crate::normalize::{tvn_on_controls, tvn_with_summary, BatchWhitening, TvnMatrix};
    pub use crate::pipeline::{
        run_aggregation, AggregateConfig, Pipeline, PipelineOutput, PipelineStep,
    };
}
