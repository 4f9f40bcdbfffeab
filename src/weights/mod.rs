//! Model weight resolution.

pub mod resolver;

pub use resolver::*;
