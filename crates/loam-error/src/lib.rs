use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for loamdb session-coordination operations.
///
/// Structured variants for the conditions a caller can act on, plus an
/// `Internal` catch-all for conditions that indicate a bug rather than an
/// environment problem.
#[derive(Error, Debug)]
pub enum LoamError {
    // === Lock-file / bootstrap errors ===
    /// The lock file was initialized by a participant with an incompatible
    /// memory layout (different coordinator version, mutex size, condvar
    /// size, or file-format agreement).
    #[error("incompatible lock file: {detail}")]
    IncompatibleLockFile { detail: String },

    /// The data file carries a history type or top-ref the session cannot
    /// use.
    #[error("invalid database file '{path}': {detail}")]
    InvalidDatabase { detail: String, path: PathBuf },

    /// A participant tried to join a session with a different durability
    /// setting than the one the session was started with.
    #[error("all session participants must use the same durability level")]
    MixedDurability,

    /// A participant tried to join a session with a different history type
    /// than the one the session was started with.
    #[error("all session participants must use the same history type")]
    MixedHistoryType,

    /// An encrypted file may only be opened from the process that started
    /// the session; encrypted mappings cannot be shared across processes.
    #[error(
        "encrypted file opened from pid {current_pid}, but the session was \
         started by pid {initiator_pid}"
    )]
    EncryptedCrossProcess { initiator_pid: u64, current_pid: u64 },

    // === Transaction errors ===
    /// A snapshot was requested that is no longer pinned, or its ring slot
    /// has been recycled.
    #[error("snapshot version is no longer available")]
    BadVersion,

    /// A transaction operation was invoked in the wrong state.
    #[error("wrong transactional state: expected {expected}, found {actual}")]
    WrongTransactState {
        expected: &'static str,
        actual: &'static str,
    },

    /// A writer crashed while publishing a commit. No further writes are
    /// possible until every participant closes and the session restarts.
    #[error("writer crashed during commit; session restart required")]
    SessionPoisoned,

    // === File format ===
    /// The data file needs a format upgrade, but the caller did not permit
    /// one.
    #[error("database file format requires an upgrade")]
    FileFormatUpgradeRequired,

    // === Configuration ===
    /// Async durability requires the external commit daemon, which this
    /// build does not provide.
    #[error("async durability is not supported by this build")]
    AsyncUnsupported,

    /// The data file does not exist and creation was not permitted.
    #[error("database not found: '{path}'")]
    DatabaseNotFound { path: PathBuf },

    // === Transient sentinels ===
    /// The allocator asked the bootstrap loop to start over (for example a
    /// file-size-zero race during a concurrent session teardown). Never
    /// surfaced from `open`.
    #[error("transient race during open; retry")]
    Retry,

    // === I/O ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation; indicates a bug in loamdb.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LoamError {
    /// True for errors that resolve themselves if the operation is retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Retry)
    }

    /// Create an incompatibility error for a named lock-file field.
    pub fn incompatible(detail: impl Into<String>) -> Self {
        Self::IncompatibleLockFile {
            detail: detail.into(),
        }
    }

    /// Create an invalid-database error.
    pub fn invalid_database(detail: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::InvalidDatabase {
            detail: detail.into(),
            path: path.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `LoamError`.
pub type Result<T> = std::result::Result<T, LoamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_incompatible() {
        let err = LoamError::incompatible("mutex size mismatch: 40 vs 48");
        assert_eq!(
            err.to_string(),
            "incompatible lock file: mutex size mismatch: 40 vs 48"
        );
    }

    #[test]
    fn error_display_wrong_state() {
        let err = LoamError::WrongTransactState {
            expected: "Ready",
            actual: "Writing",
        };
        assert_eq!(
            err.to_string(),
            "wrong transactional state: expected Ready, found Writing"
        );
    }

    #[test]
    fn error_display_encrypted() {
        let err = LoamError::EncryptedCrossProcess {
            initiator_pid: 100,
            current_pid: 200,
        };
        let msg = err.to_string();
        assert!(msg.contains("pid 200"));
        assert!(msg.contains("pid 100"));
    }

    #[test]
    fn transience() {
        assert!(LoamError::Retry.is_transient());
        assert!(!LoamError::BadVersion.is_transient());
        assert!(!LoamError::SessionPoisoned.is_transient());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: LoamError = io_err.into();
        assert!(matches!(err, LoamError::Io(_)));
    }
}
