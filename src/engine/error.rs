use ulid::Ulid;

use crate::model::{ResourceId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed, out of the bookable window, or in the past.
    InvalidInterval(&'static str),
    /// Conflicts with the given existing reservation.
    Overlap(Ulid),
    CapacityFull(u32),
    CapacityBelowCurrent { requested: u32, occupied: usize },
    InvalidCapacity(u32),
    Forbidden(Ulid),
    AlreadyParticipant(Ulid),
    AlreadyAuthor(Ulid),
    /// A new reservation lists its own author among the participants.
    AuthorInRoster(UserId),
    NotAParticipant(Ulid),
    NotFound(Ulid),
    UnknownResource(ResourceId),
    LimitExceeded(&'static str),
    /// Lock wait exceeded the configured budget.
    Timeout,
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to pgwire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval(_) => "22007",
            EngineError::Overlap(_) => "23P01",
            EngineError::CapacityFull(_) | EngineError::CapacityBelowCurrent { .. } => "23514",
            EngineError::InvalidCapacity(_) => "22003",
            EngineError::Forbidden(_) => "42501",
            EngineError::AlreadyParticipant(_)
            | EngineError::AlreadyAuthor(_)
            | EngineError::AuthorInRoster(_) => "23505",
            EngineError::NotAParticipant(_) => "P0003",
            EngineError::NotFound(_) | EngineError::UnknownResource(_) => "P0002",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Timeout => "55P03",
            EngineError::WalError(_) => "58030",
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval(_) => "invalid_interval",
            EngineError::Overlap(_) => "overlap",
            EngineError::CapacityFull(_) => "capacity_full",
            EngineError::CapacityBelowCurrent { .. } => "capacity_below_current",
            EngineError::InvalidCapacity(_) => "invalid_capacity",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::AlreadyParticipant(_) => "already_participant",
            EngineError::AlreadyAuthor(_) => "already_author",
            EngineError::AuthorInRoster(_) => "author_in_roster",
            EngineError::NotAParticipant(_) => "not_a_participant",
            EngineError::NotFound(_) => "not_found",
            EngineError::UnknownResource(_) => "unknown_resource",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Timeout => "timeout",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval(reason) => write!(f, "invalid interval: {reason}"),
            EngineError::Overlap(id) => write!(f, "overlaps existing reservation {id}"),
            EngineError::CapacityFull(max) => {
                write!(f, "reservation is full: all {max} places taken")
            }
            EngineError::CapacityBelowCurrent {
                requested,
                occupied,
            } => write!(
                f,
                "max_participants {requested} is below the {occupied} places already taken"
            ),
            EngineError::InvalidCapacity(n) => write!(f, "invalid max_participants: {n}"),
            EngineError::Forbidden(id) => {
                write!(f, "only the author may modify reservation {id}")
            }
            EngineError::AlreadyParticipant(id) => {
                write!(f, "already a participant of reservation {id}")
            }
            EngineError::AlreadyAuthor(id) => {
                write!(f, "the author cannot join reservation {id} as a participant")
            }
            EngineError::AuthorInRoster(user) => {
                write!(f, "author {user} already holds a place and cannot be listed as a participant")
            }
            EngineError::NotAParticipant(id) => {
                write!(f, "not a participant of reservation {id}")
            }
            EngineError::NotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::UnknownResource(id) => write!(f, "unknown resource: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Timeout => write!(f, "timed out waiting for the reservation lock"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
