//! Error types and operation statuses for chaindex.
//!
//! All failures inside the index are represented by [`ChaindexError`] and
//! propagated via `Result<T, ChaindexError>`. Expected non-erroneous outcomes
//! of an individual operation (a record that lives on disk, a key with no
//! chain) are *not* errors; they are carried by [`Status`].
//!
//! # Error Classification
//!
//! Errors are classified into three categories that determine how callers
//! should react:
//! - **Argument** — unknown predicate names, ill-formed settings. Surfaced
//!   immediately; the call had no effect.
//! - **Operation** — session misuse (wrong phase, poisoned session) and
//!   recovery failures. Non-recoverable for that session.
//! - **Internal** — invariant violations detected at runtime. Bugs; fail
//!   fast.
//!
//! Two further conditions are *retried internally* and never escape the
//! store: a CAS splice that would violate the downward chain invariant, and
//! a version pivot observed during the prepare phase. Both live in
//! [`crate::store`] as private outcome values, not here.

use std::fmt;

/// Primary error type for the index.
#[derive(Debug, thiserror::Error)]
pub enum ChaindexError {
    // ── Argument errors — the call had no effect ─────────────────────────
    /// An invalid argument was provided to an API function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A predicate name was not found in its group.
    #[error("unknown predicate: {0}")]
    UnknownPredicate(String),

    // ── Operation errors — session or store state forbids the call ──────
    /// A session was used incorrectly (wrong phase, or it was poisoned by an
    /// earlier predicate panic).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Checkpoint or recovery failed (missing images, digest mismatch,
    /// geometry mismatch).
    #[error("recovery error: {0}")]
    Recovery(String),

    /// An I/O error from the log device.
    #[error("device I/O error: {0}")]
    Device(#[from] std::io::Error),

    // ── Internal errors — should not happen ──────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChaindexError {
    /// Whether the operation that produced this error may be retried on the
    /// same session. Argument errors may be (after fixing the argument);
    /// operation and internal errors may not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChaindexError::InvalidArgument(_)
                | ChaindexError::UnknownPredicate(_)
                | ChaindexError::Device(_)
        )
    }

    /// Whether this error poisons the session it occurred on.
    pub fn poisons_session(&self) -> bool {
        matches!(self, ChaindexError::Internal(_))
    }
}

/// Classification of error severity/kind for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaindexErrorKind {
    Argument,
    Operation,
    Internal,
}

impl fmt::Display for ChaindexErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChaindexErrorKind::Argument => write!(f, "ARGUMENT"),
            ChaindexErrorKind::Operation => write!(f, "OPERATION"),
            ChaindexErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl ChaindexError {
    /// Classify the error.
    pub fn kind(&self) -> ChaindexErrorKind {
        match self {
            ChaindexError::InvalidArgument(_) | ChaindexError::UnknownPredicate(_) => {
                ChaindexErrorKind::Argument
            }

            ChaindexError::InvalidOperation(_)
            | ChaindexError::Recovery(_)
            | ChaindexError::Device(_) => ChaindexErrorKind::Operation,

            ChaindexError::Internal(_) => ChaindexErrorKind::Internal,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChaindexError>;

// ── Operation status ───────────────────────────────────────────────────────

/// Outcome of a single index operation.
///
/// `Pending` means the operation fell through to disk I/O and was parked as a
/// pending context; complete it via the owning session. Mutations never
/// return `Pending` (they always land at the log tail).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation completed.
    Ok,
    /// The operation needs a device read to complete.
    Pending,
    /// No matching entry exists.
    NotFound,
    /// The operation failed; the accompanying error carries details.
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Pending => "PENDING",
            Status::NotFound => "NOT_FOUND",
            Status::Error => "ERROR",
        }
    }

    /// Whether the operation reached a terminal state.
    pub fn is_complete(&self) -> bool {
        !matches!(self, Status::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
