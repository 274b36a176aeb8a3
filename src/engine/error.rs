use std::fmt;

use thiserror::Error;
use ulid::Ulid;

use crate::model::{BedId, RoomId};

/// Identifies the record an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Guest(Ulid),
    Room(RoomId),
    Bed(BedId),
    Reservation(Ulid),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Guest(id) => write!(f, "guest {id}"),
            Entity::Room(id) => write!(f, "room {id}"),
            Entity::Bed(id) => write!(f, "bed {id}"),
            Entity::Reservation(id) => write!(f, "reservation {id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(Entity),
    #[error("{0} already exists")]
    AlreadyExists(Entity),
    /// Beds that lost the race, ascending.
    #[error("beds no longer available: {}", join_ids(.0))]
    Conflict(Vec<BedId>),
    #[error("reservation {0} is already checked in")]
    AlreadyCheckedIn(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

fn join_ids(ids: &[BedId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
