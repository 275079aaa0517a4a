//! Error types for orchestration failures
//!
//! Assertion mismatches are not errors here: they are returned as values
//! from [`crate::assert`] so a single test can report all of them at once.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("no test.yaml files found matching patterns")]
    NoSpecs,

    #[error("Test spec parse error: {0}")]
    SpecParse(String),

    #[error("Invalid spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("building {spec}: {reason}")]
    Build { spec: String, reason: String },

    #[error("building {spec}: timed out after {timeout:?}")]
    BuildTimeout { spec: String, timeout: Duration },

    #[error("building {spec}: no pre-built binary configured for prebuilt tests")]
    MissingArtifact { spec: String },

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("server not ready after {elapsed:?} ({attempts} polls) (stdout: {stdout}, stderr: {stderr})")]
    ReadinessTimeout {
        elapsed: Duration,
        attempts: usize,
        stdout: String,
        stderr: String,
    },

    #[error("server exited before becoming ready ({status}) (stdout: {stdout}, stderr: {stderr})")]
    ProcessExited {
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
