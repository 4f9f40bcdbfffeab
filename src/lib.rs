//! `ob-pipeline` library crate.
//!
//! The binary (`ob`) is a thin wrapper around this library so that:
//!
//! - the batch pipeline is testable without spawning processes
//! - inference backends can be swapped behind the `backend` traits
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod backend;
pub mod cli;
pub mod domain;
pub mod error;
pub mod io;
pub mod report;
pub mod schedule;
pub mod task;
pub mod volume;
pub mod weights;

#[cfg(test)]
pub(crate) mod testing;
