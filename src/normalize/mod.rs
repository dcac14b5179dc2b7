//! Control-referenced normalization of embeddings.
//!
//! - **TVN**: per-batch centering and whitening against control cells

pub mod tvn;

pub use tvn::{tvn_on_controls, tvn_with_summary, BatchWhitening, TvnMatrix, EIGENVALUE_TOLERANCE};
