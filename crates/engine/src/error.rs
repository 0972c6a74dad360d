//! Error types for the test engine

use std::path::PathBuf;
use thiserror::Error;

/// Recoverable cache failures. Always answered by falling back to the live path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("No cached run found for test {identifier}")]
    NotFound { identifier: String },

    #[error("Cached run is no longer valid: {reason}")]
    Invalid { reason: String },
}

/// Failures raised by test callbacks and assertions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TestError {
    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Callback execution failed: {0}")]
    CallbackFailed(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Test(#[from] TestError),

    #[error("Invalid state transition: {message}")]
    InvalidTransition { message: String },

    #[error("Test discovery failed: {0}")]
    Discovery(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to load test file {path}: {reason}")]
    Loader { path: PathBuf, reason: String },

    #[error("Action failed: {0}")]
    Executor(String),

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Action decider error: {0}")]
    Decider(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

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

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Invalid test pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

impl EngineError {
    pub(crate) fn invalid_transition(message: impl Into<String>) -> Self {
        EngineError::InvalidTransition {
            message: message.into(),
        }
    }

    pub(crate) fn cache_invalid(reason: impl Into<String>) -> Self {
        EngineError::Cache(CacheError::Invalid {
            reason: reason.into(),
        })
    }

    /// True for cache misses and invalidations.
    pub fn is_cache_error(&self) -> bool {
        matches!(self, EngineError::Cache(_))
    }

    /// Errors that are turned into a failed result for the current unit of
    /// work instead of aborting the whole run.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            EngineError::Config(_) | EngineError::Toml(_) | EngineError::Pattern(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
