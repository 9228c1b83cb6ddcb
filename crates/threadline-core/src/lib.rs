//! # Threadline Core
//!
//! Shared error types and configuration for the Threadline publishing
//! engine.

pub mod config;
pub mod error;

pub use config::AppConfig;
pub use error::{Error, ErrorCategory, Result};
