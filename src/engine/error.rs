use thiserror::Error;
use ulid::Ulid;

use crate::lifecycle::EffectiveStatus;
use crate::model::Ms;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Another OPEN or SCHEDULED row already holds this time.
    #[error("slot taken: service {service_id} at {appointment_date}")]
    SlotTaken { service_id: Ulid, appointment_date: Ms },
    /// A claim lost the race. Re-query the slot list, do not retry the same slot.
    #[error("this time is no longer available: {0}")]
    Conflict(Ulid),
    #[error("appointment {id} is {status}")]
    InvalidState { id: Ulid, status: EffectiveStatus },
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Expected under load; the caller should pick another slot.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}
