//! Principal-component embedding shared across batches.

pub mod pca;

pub use pca::{
    component_names, embed_by_pca, PcaBasis, PcaConfig, PcaEmbedding, VarianceOrNcomp,
    DEFAULT_SAMPLE_CAP,
};
