// ABOUTME: Typed failure taxonomy for sync cycles
// ABOUTME: Classifies errors so the orchestrator can decide skip, fallback or report

use thiserror::Error;

use crate::sql::LexError;

/// Errors that end a sync cycle (or one table within it).
///
/// Reference loss detected during a diff and empty changesets are not errors;
/// they surface as [`crate::diff::DiffOutcome::Fallback`] and
/// [`crate::apply::ApplyOutcome::Noop`] instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An endpoint could not be reached; the next scheduled cycle retries.
    #[error("connection to {endpoint} failed: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    /// Another instance owns the task lease; the cycle is skipped.
    #[error("lease for task {task_id} is held by {owner}")]
    LockHeld { task_id: String, owner: String },

    /// Source or destination table definition is unusable.
    #[error("schema error on {table}: {source}")]
    Schema {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// A reference point disappeared and the FULL fallback was already used.
    #[error("reference point {snapshot} no longer exists")]
    ReferenceLost { snapshot: String },

    /// The destination transaction was rolled back; no partial writes survive.
    #[error("apply to {table} failed and was rolled back: {source}")]
    Apply {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// A changeset could not be split into statements safely.
    #[error("changeset {artifact} is malformed: {source}")]
    Lex {
        artifact: String,
        #[source]
        source: LexError,
    },

    /// Source and destination disagree after a completed sync.
    #[error(
        "verification mismatch on {table}: source ({src_count}, {src_hash:?}) vs destination ({dst_count}, {dst_hash:?})"
    )]
    VerificationMismatch {
        table: String,
        src_count: u64,
        src_hash: Option<u64>,
        dst_count: u64,
        dst_hash: Option<u64>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stable classification used in reports and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    LockHeld,
    Schema,
    ReferenceLost,
    Apply,
    Lex,
    VerificationMismatch,
    Other,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Connection { .. } => ErrorKind::Connection,
            SyncError::LockHeld { .. } => ErrorKind::LockHeld,
            SyncError::Schema { .. } => ErrorKind::Schema,
            SyncError::ReferenceLost { .. } => ErrorKind::ReferenceLost,
            SyncError::Apply { .. } => ErrorKind::Apply,
            SyncError::Lex { .. } => ErrorKind::Lex,
            SyncError::VerificationMismatch { .. } => ErrorKind::VerificationMismatch,
            SyncError::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether the failure is expected to clear up by itself on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Connection { .. } | SyncError::LockHeld { .. } | SyncError::ReferenceLost { .. }
        )
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
