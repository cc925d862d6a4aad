//! Error types for waypost.
//!
//! Most coordination failures never reach the caller as errors: the store
//! degrades, readers get `None`, and readiness checks answer "not complete".
//! [`CoordError`] covers the operations that do report failure, chiefly the
//! locked read-modify-write cycle, which must fail closed.

use std::time::Duration;

use thiserror::Error;

/// The main error type for waypost operations.
///
/// This enum uses `#[non_exhaustive]` so new failure kinds can be added
/// without breaking downstream matches.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordError {
    /// The backing store could not be reached or did not answer in time.
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    /// The per-session lock was not acquired within the acquisition timeout.
    #[error("Timed out after {waited:?} waiting for the lock on session {session_id}")]
    LockTimeout {
        /// Session whose lock was contended.
        session_id: String,
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The session id cannot be used as a storage key or marker path.
    #[error("Invalid session id {0:?}")]
    InvalidSessionId(String),

    /// A recognised field in an untyped update carried the wrong type.
    #[error("Invalid value for field `{field}`: {reason}")]
    InvalidField {
        /// Field name as supplied by the caller.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The name does not match any milestone flag.
    #[error("Unknown milestone: {0}")]
    UnknownMilestone(String),

    /// The value does not match any workflow status.
    #[error("Unknown workflow status: {0}")]
    UnknownStatus(String),

    /// A strict transition policy refused a backward status move.
    #[error("Illegal status transition from {from} to {to}")]
    IllegalTransition {
        /// Status currently stored.
        from: String,
        /// Status the caller attempted to write.
        to: String,
    },

    /// A downstream stage required a milestone that no evidence confirms.
    #[error("Milestone {milestone} is not complete for session {session_id}")]
    MilestoneNotReady {
        /// Session that was checked.
        session_id: String,
        /// Milestone that was required.
        milestone: String,
    },

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from marker or artifact operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Database error from the SQLite backend.
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(String),
}

impl CoordError {
    /// Returns true for failures caused by the store being unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Returns true if retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::LockTimeout { .. })
    }
}

/// A specialized `Result` type for waypost operations.
pub type Result<T> = std::result::Result<T, CoordError>;
