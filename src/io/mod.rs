//! Output files.
//!
//! - factor table CSV (`export`)

pub mod export;

pub use export::*;
