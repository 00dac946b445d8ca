//! Utility modules for configuration, error handling, and binary encoding.

pub(crate) mod codec;
pub mod config;
pub mod errors;

pub use config::*;
pub use errors::*;
