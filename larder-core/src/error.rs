//! Error types for LARDER operations

use std::time::Duration;
use thiserror::Error;

/// Which kind of identifier failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    Key,
    Tag,
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentifierKind::Key => write!(f, "key"),
            IdentifierKind::Tag => write!(f, "tag"),
        }
    }
}

/// Validation errors.
///
/// These are raised to the caller and are never recoverable locally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Cache {kind} must not be empty")]
    Empty { kind: IdentifierKind },

    #[error("Cache {kind} {value:?} contains reserved character {character:?}")]
    ReservedCharacter {
        kind: IdentifierKind,
        value: String,
        character: char,
    },

    #[error("Invalid TTL: {reason}")]
    InvalidTtl { reason: String },

    #[error("Value stored under {key:?} is not an integer counter")]
    NotACounter { key: String },

    #[error("Counter {key:?} overflowed applying delta {delta}")]
    CounterOverflow { key: String, delta: i64 },

    #[error("Invalid value for {key:?}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Storage layer errors.
///
/// A backend that *refuses* a write reports `Ok(false)`; these variants are
/// reserved for failures to talk to the backend at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Backend {backend} failed: {reason}")]
    Backend { backend: String, reason: String },

    #[error("Connection not configured: {name}")]
    ConnectionNotFound { name: String },

    #[error("Corrupt payload under {key:?}: {reason}")]
    CorruptPayload { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Distributed lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock {name}")]
    Timeout { name: String, waited: Duration },
}

/// Master error type for all LARDER errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LarderError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

impl LarderError {
    /// Returns true when the caller supplied something the protocol cannot carry.
    pub fn is_validation(&self) -> bool {
        matches!(self, LarderError::Validation(_))
    }
}

/// Result type alias for LARDER operations.
pub type LarderResult<T> = Result<T, LarderError>;

// =============================================================================
// TESTS
// =============================================================================
