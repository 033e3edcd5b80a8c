//! Infrastructure layer: job stores, the job runtime and configuration.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, JobsConfig};
