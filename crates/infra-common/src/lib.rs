//! Shared infrastructure for the peerlink crates.
//!
//! - `errors`: the infrastructure error type and context helpers
//! - `logging`: tracing subscriber setup for applications and tests
//! - `config`: layered configuration loading (TOML file + environment)
//! - `tasks`: tracked task spawning with cooperative cancellation

pub mod config;
pub mod errors;
pub mod logging;
pub mod tasks;

pub use errors::types::{Error, Result};
pub use logging::setup::{setup_logging, LoggingConfig};
pub use tasks::{TaskManager, TaskStats};
