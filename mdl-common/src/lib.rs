//! # Media Pipeline Common Library
//!
//! Shared code for the pipeline crates:
//! - Error type and result alias
//! - TOML configuration loading and path resolution
//! - Atomic document writes
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod fs;
pub mod time;

pub use error::{Error, Result};
