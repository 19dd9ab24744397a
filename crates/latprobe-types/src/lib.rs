//! Shared domain types for the latprobe harness.

pub mod config;
pub mod events;
pub mod records;

mod errors;

pub use errors::{LatprobeError, Result};
