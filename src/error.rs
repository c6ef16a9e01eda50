use thiserror::Error;

use crate::identity::ImageId;

/// Failure classes reported by loaders.
///
/// The scheduler decides whether to retry a failed load purely from its
/// class, so loaders should pick the class that best describes the cause.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connection reset, refused, DNS failure, 5xx from a remote store
    Network,

    /// The load did not finish within the allotted time
    Timeout,

    /// The resource does not exist at the source
    NotFound,

    /// The bytes arrived but could not be decoded
    Decode,

    /// The resource is in a format the loader does not understand
    Format,

    /// The loader abandoned the work on request
    Cancelled,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Network => "network",
            ErrorClass::Timeout => "timeout",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Decode => "decode",
            ErrorClass::Format => "format",
            ErrorClass::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Error returned by a [`Loader`](crate::loader::Loader).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class} error: {message}")]
pub struct LoadError {
    pub class: ErrorClass,
    pub message: String,
}

impl LoadError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Decode, message)
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Format, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorClass::Cancelled, "load cancelled by loader")
    }
}

/// Errors raised by the image cache contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Entry cannot fit in the budget even after evicting every unprotected entry
    #[error("Entry {id} of {size} bytes cannot fit: budget is {max_bytes} bytes, {protected_bytes} bytes are protected")]
    OversizedEntry {
        id: ImageId,
        size: usize,
        max_bytes: usize,
        protected_bytes: usize,
    },

    /// Illegal reference count transition (release without acquire)
    #[error("Invalid state for {id}: {message}")]
    InvalidState { id: ImageId, message: String },

    /// acquire/release on an identity that is not resident
    #[error("Not cached: {0}")]
    NotCached(ImageId),
}

/// Configuration errors, reported when the pipeline is configured rather
/// than when a request is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Pool {pool} must allow at least one concurrent load")]
    ZeroConcurrency { pool: String },

    #[error("Pool name must not be empty")]
    EmptyPoolName,

    #[error("Pool {0} is configured more than once")]
    DuplicatePool(String),

    #[error("Cache budget must be greater than 0")]
    ZeroBudget,

    #[error("Invalid size {input:?}: {reason}")]
    InvalidSize { input: String, reason: String },

    #[error("Invalid pool definition {0:?}: expected NAME=MAX_CONCURRENCY")]
    InvalidPoolSpec(String),

    #[error("Failed to read config {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// Errors delivered to callers of the load pipeline.
///
/// A single failure is cloned to every waiter attached to the identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// No loader registered for the identity's scheme and no fallback
    #[error("No {} loader registered for scheme {scheme:?} (identity {id})", .id.kind())]
    UnknownScheme { id: ImageId, scheme: String },

    /// The request named a pool that was never configured
    #[error("Unknown request pool: {0}")]
    UnknownPool(String),

    /// Loaded payload could not be admitted to the cache
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The loader failed, after `attempts` tries
    #[error("Load of {id} failed after {attempts} attempt(s): {error}")]
    LoadFailed {
        id: ImageId,
        error: LoadError,
        attempts: u32,
    },

    /// Every waiter was cancelled, or the loader cancelled the work
    #[error("Load of {0} was cancelled")]
    Cancelled(ImageId),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Whether this failure came from a loader error of the given class.
    pub fn is_load_class(&self, class: ErrorClass) -> bool {
        matches!(self, PipelineError::LoadFailed { error, .. } if error.class == class)
    }
}
