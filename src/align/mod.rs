//! Batch and control annotation for alignment.

pub mod prepare;

pub use prepare::{
    batch_key, prepare_alignment_data, BATCH_VALUES_COL, CONTROL_ID_COL, IS_CONTROL_COL,
};
