use crate::domain::recommendation::Status;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid transition for recommendation {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: Status, to: Status },

    #[error("precondition failed for recommendation {id}: {detail}")]
    PreconditionFailed { id: Uuid, detail: String },

    #[error("concurrent modification of recommendation {id}: expected {expected}, found {actual}")]
    ConcurrentModification {
        id: Uuid,
        expected: Status,
        actual: Status,
    },

    #[error("recommendation {id} is already executing")]
    AlreadyExecuting { id: Uuid },

    #[error("recommendation {id} not found")]
    NotFound { id: Uuid },

    #[error("store error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Errors a caller can resolve by re-reading and trying again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::AlreadyExecuting { .. }
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(anyhow::Error::new(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierErrorKind {
    /// Network/timeout class; retried within the attempt.
    Transient,
    /// Validation/permission class; never retried.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplierError {
    pub kind: ApplierErrorKind,
    pub reason: String,
}

impl ApplierError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: ApplierErrorKind::Transient,
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            kind: ApplierErrorKind::Permanent,
            reason: reason.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::transient("timeout")
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ApplierErrorKind::Transient
    }
}

impl fmt::Display for ApplierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ApplierErrorKind::Transient => "transient",
            ApplierErrorKind::Permanent => "permanent",
        };
        write!(f, "applier failure ({kind}): {}", self.reason)
    }
}

impl std::error::Error for ApplierError {}
