//! Engine Errors
//!
//! Validation failures happen before any state change. Remote failures
//! arrive after an optimistic apply and have already been rolled back by
//! the time the caller sees them.

use thiserror::Error;

use crate::domain::{Action, DomainError, GroupId, ItemId};

/// A precondition rejected the mutation; nothing was changed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Group {group} is locked by {by}")]
    Locked { group: GroupId, by: String },
    #[error("{principal} is not allowed to {}", action.as_str())]
    PermissionDenied { principal: String, action: Action },
    #[error("Element {element} is already placed in this group tree")]
    UniquenessConflict { element: String },
    #[error("Nesting depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: u8, max: u8 },
    #[error("A group cannot be moved under itself or one of its descendants")]
    CyclicMove,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("{} item(s) already have a value; confirm to overwrite", conflicts.len())]
    ConfirmationRequired { conflicts: Vec<ItemId> },
    #[error("Custom fields can only be defined on a root group")]
    SchemaNotInheritable,
}

#[derive(Debug, Error)]
pub enum OrganizerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The optimistic change has been rolled back
    #[error("Remote write failed: {0}")]
    RemoteWrite(#[source] DomainError),
    /// Confirmed chunks were kept; the rest was rolled back
    #[error("{confirmed} row(s) saved, {failed} row(s) failed: {source}")]
    PartialBatch {
        confirmed: usize,
        failed: usize,
        #[source]
        source: DomainError,
    },
    /// A fetch failed; local state is unchanged
    #[error("Remote read failed: {0}")]
    RemoteRead(#[source] DomainError),
    #[error("Nothing to undo")]
    NothingToUndo,
    #[error("Realtime subscription failed: {0}")]
    Realtime(#[source] DomainError),
}

impl OrganizerError {
    pub fn is_validation(&self) -> bool {
        matches!(self, OrganizerError::Validation(_))
    }

    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            OrganizerError::Validation(e) => Some(e),
            _ => None,
        }
    }
}

pub type OrganizerResult<T> = Result<T, OrganizerError>;
