//! Lotkeeper Core Library
//!
//! Shared functionality for Lotkeeper components:
//! - Process-wide configuration (timeouts, intervals, feature flags)
//! - `SQLite` pool helpers and shared database error type
//! - Plate-string matching (trailing-digit fuzzy comparison)
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod plate;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
