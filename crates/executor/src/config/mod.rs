//! Configuration module for the flowrun executor.
//!
//! Configuration is loaded from environment variables with the `envy` crate.

mod app;
mod database;

pub use app::{AppConfig, StorageBackend};
pub use database::DatabaseConfig;
