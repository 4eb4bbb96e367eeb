use std::time::Duration;

use thiserror::Error;
use ulid::Ulid;

use crate::store::StoreError;

/// Message shown to clients for any internal failure. Details go to the log.
pub const INTERNAL_FAILURE_MESSAGE: &str = "unable to perform your request, please try again later";

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    CapacityExhausted,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(&'static str),
    #[error("this time is already in use")]
    ScheduleConflict { hall_id: Ulid, with: Ulid },
    #[error("user {requested} does not match authenticated user {authenticated}")]
    NotOwner { requested: Ulid, authenticated: Ulid },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("cannot delete {0}: still referenced by {1}")]
    InUse(Ulid, &'static str),
    #[error("no seats left in session {session_id} ({seat_count} seats)")]
    CapacityExhausted { session_id: Ulid, seat_count: u32 },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("transaction timed out after {0:?}")]
    TimedOut(Duration),
    #[error("rollback failed after: {cause}")]
    RollbackFailed {
        cause: Box<EngineError>,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(StoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_)
            | EngineError::ScheduleConflict { .. }
            | EngineError::NotOwner { .. }
            | EngineError::NotFound(_)
            | EngineError::AlreadyExists(_)
            | EngineError::InUse(..)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::CapacityExhausted { .. } => ErrorKind::CapacityExhausted,
            EngineError::TimedOut(_) | EngineError::RollbackFailed { .. } | EngineError::Store(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Text safe to show a client.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => INTERNAL_FAILURE_MESSAGE.to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::AlreadyExists(id) => EngineError::AlreadyExists(id),
            StoreError::Referenced { id, by } => EngineError::InUse(id, by),
            StoreError::LimitExceeded(what) => EngineError::LimitExceeded(what),
            // Seat collisions can't happen under the session lock, so one
            // showing up is a store fault, not a user error.
            other => EngineError::Store(other),
        }
    }
}
