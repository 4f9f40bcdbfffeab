//! Batch reporting: the terminal summary and `batch_summary.json`.
//!
//! Formatting lives here so the scheduler and collector only deal in
//! results, and output changes stay in one place.

pub mod format;

pub use format::*;
