use std::path::PathBuf;

use thiserror::Error;

/// Validation errors for caller-supplied identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("entity key cannot be empty")]
    EmptyKey,
    #[error("entity key length {len} exceeds max {max}")]
    KeyTooLong { len: usize, max: usize },
    #[error("entity key must start with an ASCII letter: '{ch}'")]
    KeyInvalidStart { ch: char },
    #[error("entity key contains invalid character '{ch}' at index {index}")]
    KeyInvalidChar { ch: char, index: usize },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to build http transport: {0}")]
    Transport(String),
}

/// Errors raised by the orchestrator before any pipeline work begins.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("analysis already running for {0}")]
    AlreadyRunning(String),

    #[error(transparent)]
    InvalidKey(#[from] ValidationError),
}

/// Pipeline-level failure: a mandatory step could not produce its dataset.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("step '{step}' failed: {message}")]
    MandatoryStep { step: &'static str, message: String },
}
