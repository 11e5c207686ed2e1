//! Logging setup built on `tracing-subscriber`.
//!
//! Library crates only emit `tracing` events; applications (and tests) call
//! [`setup::setup_logging`] once to install a subscriber.

pub mod setup;

pub use setup::{init_test_logging, parse_log_level, setup_logging, LoggingConfig};
