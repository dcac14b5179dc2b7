//! Per-perturbation aggregation of aligned embeddings.

pub mod group;
pub mod table;

pub use group::{aggregate, AggMethod, AggregateOptions};
pub use table::{AggregateRecord, AggregateTable};
