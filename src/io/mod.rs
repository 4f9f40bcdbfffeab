//! Output helpers.
//!
//! - copying subject outputs into the output tree (`collect`)
//! - the aggregate statistics table (`table`)
//! - the debug job graph (`graph`)

pub mod collect;
pub mod graph;
pub mod table;

pub use collect::*;
pub use graph::*;
pub use table::*;
