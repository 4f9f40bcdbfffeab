//! Parallel execution of a batch.

pub mod cache;
pub mod gpu;
pub mod scheduler;

pub use gpu::*;
pub use scheduler::*;
