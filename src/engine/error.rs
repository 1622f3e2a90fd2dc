use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or policy-violating request.
    Validation(String),
    /// Device unavailable for the window, or not enough supply for a batch.
    Conflict(String),
    NotFound(Ulid),
    /// Illegal status transition.
    State {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    /// Operation not allowed in the reservation's current state (e.g. second rating).
    InvalidState(String),
    AlreadyExists(String),
    LimitExceeded(&'static str),
    WalError(String),
}

/// Coarse category for callers that map errors onto a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    State,
    Storage,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::Conflict(_) | EngineError::AlreadyExists(_) => ErrorKind::Conflict,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::State { .. } | EngineError::InvalidState(_) => ErrorKind::State,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::State { from, to } => {
                write!(f, "illegal status transition {from} -> {to}")
            }
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
