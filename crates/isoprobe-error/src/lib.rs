//! Error taxonomy for isoprobe.
//!
//! The retry engine only needs one bit of classification: transient errors
//! are rolled back and retried with backoff, everything else aborts the
//! current iteration. The classification lives on the error type itself
//! (`is_transient`) so callers never match on host-specific failure details.

use thiserror::Error;

/// Primary error type for probe operations.
#[derive(Error, Debug)]
pub enum ProbeError {
    // === Transient conflicts (retried) ===
    /// The store detected a serialization conflict (first-committer-wins
    /// or read-set validation failure).
    #[error("serialization conflict: {detail}")]
    SerializationConflict { detail: String },

    /// This transaction lost a deadlock or timed out waiting for a row lock.
    #[error("deadlock loser: {detail}")]
    DeadlockLoser { detail: String },

    /// A version-guarded update observed a stale version.
    #[error("optimistic lock conflict: {detail}")]
    OptimisticLockConflict { detail: String },

    // === Fatal data errors (not retried) ===
    /// An update affected an unexpected number of rows.
    #[error("expected {expected} affected row(s), got {actual}: {detail}")]
    RowCountMismatch {
        expected: usize,
        actual: usize,
        detail: String,
    },

    /// An in-iteration invariant check failed. This is a caller bug,
    /// not an isolation anomaly.
    #[error("data integrity violation: {detail}")]
    IntegrityViolation { detail: String },

    /// Row lookup by key found nothing.
    #[error("account not found: id={id} type={kind}")]
    NotFound { id: i64, kind: String },

    /// The retry budget was spent entirely on transient conflicts.
    #[error("too many transient errors ({attempts}) - giving up")]
    RetriesExhausted { attempts: u32 },

    /// The store is unreachable or shut down.
    #[error("store unavailable: {detail}")]
    Unavailable { detail: String },

    /// Settings failed pre-flight validation.
    #[error("invalid settings: {detail}")]
    InvalidSettings { detail: String },

    /// I/O error (report export, seed scripts).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Whether this error may succeed on retry.
    ///
    /// Only these three kinds are retried by the transaction runner;
    /// everything else propagates immediately.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SerializationConflict { .. }
                | Self::DeadlockLoser { .. }
                | Self::OptimisticLockConflict { .. }
        )
    }

    /// Create a serialization-conflict error.
    pub fn serialization(detail: impl Into<String>) -> Self {
        Self::SerializationConflict {
            detail: detail.into(),
        }
    }

    /// Create a deadlock-loser error.
    pub fn deadlock(detail: impl Into<String>) -> Self {
        Self::DeadlockLoser {
            detail: detail.into(),
        }
    }

    /// Create an optimistic-lock-conflict error.
    pub fn stale_version(detail: impl Into<String>) -> Self {
        Self::OptimisticLockConflict {
            detail: detail.into(),
        }
    }

    /// Create an integrity-violation error.
    pub fn integrity(detail: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            detail: detail.into(),
        }
    }

    /// Create an invalid-settings error.
    pub fn settings(detail: impl Into<String>) -> Self {
        Self::InvalidSettings {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `ProbeError`.
pub type Result<T> = std::result::Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProbeError::serialization("fcw").is_transient());
        assert!(ProbeError::deadlock("lock wait timeout").is_transient());
        assert!(ProbeError::stale_version("version 3 != 4").is_transient());

        assert!(!ProbeError::integrity("leg sum != 0").is_transient());
        assert!(!ProbeError::RetriesExhausted { attempts: 15 }.is_transient());
        assert!(!ProbeError::NotFound {
            id: 1,
            kind: "checking".to_owned()
        }
        .is_transient());
        assert!(!ProbeError::RowCountMismatch {
            expected: 1,
            actual: 0,
            detail: String::new()
        }
        .is_transient());
    }

    #[test]
    fn error_display() {
        let err = ProbeError::RetriesExhausted { attempts: 15 };
        assert_eq!(
            err.to_string(),
            "too many transient errors (15) - giving up"
        );

        let err = ProbeError::RowCountMismatch {
            expected: 1,
            actual: 0,
            detail: "update account 42/checking".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "expected 1 affected row(s), got 0: update account 42/checking"
        );
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: ProbeError = io_err.into();
        assert!(matches!(err, ProbeError::Io(_)));
        assert!(!err.is_transient());
    }
}
