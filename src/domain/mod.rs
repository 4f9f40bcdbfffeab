//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - fold selection and resolved weight sets (`FoldSelector`, `ModelWeightSet`)
//! - the immutable runtime configuration (`PipelineConfig`, `StageConfig`)
//! - subjects, per-subject results and the batch description (`BatchRun`)

pub mod types;

pub use types::*;
