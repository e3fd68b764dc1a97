//! Error taxonomy for per-object sync operations.
//!
//! The split matters at the object-push boundary: a [`SyncError::Transport`]
//! is recorded in the object's note and the run continues to the next object,
//! while every other variant indicates a state or data-integrity problem and
//! aborts the current command.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote call failed. Recorded per-object, never fatal to the run.
    #[error("{0}")]
    Transport(String),

    /// Invalid data that continuing would compound (e.g. a policy referencing
    /// a nonexistent rule, or an overwrite without `--overwrite`).
    #[error("{0}")]
    Validation(String),

    /// Operation attempted in a state it cannot run in (e.g. push with no
    /// content loaded).
    #[error("{0}")]
    InvalidState(String),

    /// A secondary-key lookup matched more than one remote object.
    #[error("found duplicates of {path}: {ids}. This should not happen")]
    DuplicateKey { path: String, ids: String },
}

impl SyncError {
    /// Whether this error should be captured into the object's note rather
    /// than propagated.
    pub fn is_recordable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}
