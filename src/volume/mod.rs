//! Voxel volumes, cropping and structure statistics.

pub mod stats;
pub mod volume;

pub use stats::*;
pub use volume::*;
