use ulid::Ulid;

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Missing record; the first field names the kind (branch, staff, ...).
    NotFound(&'static str, Ulid),
    InvalidInterval(&'static str),
    /// The insert-time re-check found this active appointment in the way.
    SlotUnavailable(Ulid),
    AlreadyExists(Ulid),
    InvalidTransition(Ulid),
    ConflictPersistence(String),
    ResolutionExecution(String),
    LimitExceeded(&'static str),
    /// Backing store failure with no business meaning.
    Store(StoreError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(kind, id) => write!(f, "{kind} not found: {id}"),
            EngineError::InvalidInterval(msg) => write!(f, "invalid interval: {msg}"),
            EngineError::SlotUnavailable(id) => {
                write!(f, "slot unavailable: taken by appointment {id}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition(id) => {
                write!(f, "invalid status transition for appointment {id}")
            }
            EngineError::ConflictPersistence(e) => write!(f, "failed to record conflict: {e}"),
            EngineError::ResolutionExecution(e) => write!(f, "resolution failed: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SlotTaken(id) => EngineError::SlotUnavailable(id),
            StoreError::DuplicateKey(id) => EngineError::AlreadyExists(id),
            StoreError::NotFound(id) => EngineError::NotFound("record", id),
            StoreError::InvalidTransition(id) => EngineError::InvalidTransition(id),
            StoreError::LimitExceeded(msg) => EngineError::LimitExceeded(msg),
            other => EngineError::Store(other),
        }
    }
}

impl EngineError {
    /// Errors a caller is expected to act on, as opposed to infrastructure failures.
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound(..)
                | EngineError::InvalidInterval(_)
                | EngineError::SlotUnavailable(_)
        )
    }
}
