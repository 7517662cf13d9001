use std::path::PathBuf;

use thiserror::Error;

/// A feature vector that cannot be fed to the classifier.
#[derive(Debug, Error, PartialEq)]
pub enum LandmarkError {
    #[error("landmark value {value} at index {index} is not finite")]
    NonFinite { index: usize, value: f32 },
    #[error("landmark vector is empty")]
    Empty,
}

/// Every fallback for a resource has been tried without success.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("no candidates available for {what}")]
    NoCandidates { what: String },
    #[error("{what} unavailable after {attempts} attempts: {last}")]
    Exhausted {
        what: String,
        attempts: usize,
        last: String,
        failures: Vec<String>,
    },
}

impl ResourceError {
    pub fn what(&self) -> &str {
        match self {
            ResourceError::NoCandidates { what } | ResourceError::Exhausted { what, .. } => what,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
