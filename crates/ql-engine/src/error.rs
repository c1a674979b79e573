use ql_core::{PolicyError, ProjectionError, ValidationError};
use ql_db::DbError;
use thiserror::Error;

use crate::archive::ArchiveError;

/// Errors raised by the write path, snapshotting, restore, and workers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A snapshot was requested before every projection had applied an event,
    /// or a stored snapshot lacks a projection's entry.
    #[error("projection {projection} has no state to checkpoint yet")]
    IncompleteState { projection: &'static str },
    /// An event failed to apply while rebuilding state. Fatal at startup.
    #[error("replay failed at event {event_id}: {source}")]
    Replay {
        event_id: String,
        #[source]
        source: ProjectionError,
    },
    /// The write gate refused the append.
    #[error("this node is not the active writer (epoch {epoch})")]
    NotWriter { epoch: i64 },
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    /// A referenced record does not exist.
    #[error("not found: {key}")]
    NotFound { key: String },
    #[error("failed to encode payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether a periodic worker should treat this as an expected, quiet skip.
    pub const fn is_expected_skip(&self) -> bool {
        matches!(self, Self::IncompleteState { .. } | Self::Db(DbError::NoSnapshot))
    }
}
