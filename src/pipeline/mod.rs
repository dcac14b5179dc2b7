//! Pipeline composition and execution for alignment and aggregation.

mod config;
mod runner;

pub use config::AggregateConfig;
pub use runner::{run_aggregation, Pipeline, PipelineOutput, PipelineStep, ALL_CLASSES};
