//! Common utilities and types shared across the drivestash crates.
//!
//! This module provides the error taxonomy every remote call reports through
//! and the configuration record the drive client is built from.

pub mod config;
pub mod error;

pub use config::{BackoffConfig, DriveConfig};
pub use error::{Error, Result};
