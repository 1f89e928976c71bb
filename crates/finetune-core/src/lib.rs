//! Core types and utilities for two-phase transfer-learning runs.
//!
//! This crate provides the error type, run configuration, epoch metrics,
//! backend aliases and CLI helpers shared by the data and training crates.

pub mod error;
pub mod types;
pub mod config;
pub mod metrics;
pub mod backend;
pub mod cli;

pub use error::{Error, Result};
pub use types::*;
pub use config::*;
pub use metrics::*;
pub use backend::*;
pub use cli::*;

/// Re-export commonly used burn types
pub mod prelude {
    pub use burn::prelude::*;
    pub use crate::error::{Error, Result};
    pub use crate::types::*;
    pub use crate::config::*;
    pub use crate::metrics::*;
    pub use crate::backend::*;
}
