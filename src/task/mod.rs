//! Subject discovery and the per-subject pipeline.

pub mod discover;
pub mod subject_task;

pub use discover::*;
pub use subject_task::*;
