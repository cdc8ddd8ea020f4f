//! Error taxonomy of the sync engine.

use std::time::Duration;
use thiserror::Error;

use crate::mission::MissionId;
use crate::registry::PendingKind;

/// Failure of a backend round trip.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// The event channel could not deliver the command or its response.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),

    /// The backend processed the command and refused it.
    #[error("backend rejected {command}: {message}")]
    Rejected { command: String, message: String },

    /// The response arrived but could not be decoded.
    #[error("invalid response to {command}: {message}")]
    Decode { command: String, message: String },
}

/// Errors returned by [`crate::executor::CommandExecutor`] operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Local validation failed; no command was sent.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Another optimistic operation of the same kind is in flight for this mission.
    #[error("{kind} already in flight for mission {id}")]
    Conflict { id: MissionId, kind: PendingKind },

    /// The backend round trip failed; the optimistic change was rolled back.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SyncError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Internal reconciliation failures. Never surfaced to the user.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    #[error("unknown notification kind: {0}")]
    UnknownEvent(String),

    #[error("malformed {event} payload: {message}")]
    Malformed { event: String, message: String },

    #[error("stale {event} for mission {id}: {reason}")]
    Stale {
        event: String,
        id: MissionId,
        reason: String,
    },
}
