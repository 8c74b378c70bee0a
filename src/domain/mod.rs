//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - raw inputs (`PriceBar`, `DateRange`)
//! - geometry and model selection (`LookbackProfile`, `Architecture`, `Device`)
//! - dataset units (`Image`, `Sample`, `SymbolImageSet`)
//! - the output row (`FactorRecord`)

pub mod types;

pub use types::*;
