use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::{AppointmentStore, CasOutcome, EngineError, StatusUpdate};

/// Claim an OPEN slot for the caller.
///
/// At most one concurrent caller gets `Ok` for a given slot; the others get
/// `Conflict`. A slot that is not OPEN any more is always a `Conflict`.
pub async fn claim<S: AppointmentStore + ?Sized>(
    store: &S,
    slot_id: Ulid,
    caller: Option<Ulid>,
) -> Result<Appointment, EngineError> {
    let user_id = caller.ok_or(EngineError::Unauthorized("claim requires a resolved identity"))?;
    let result = try_claim(store, slot_id, user_id).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(_) => "error",
    };
    metrics::counter!(crate::observability::CLAIMS_TOTAL, "outcome" => outcome).increment(1);
    result
}

async fn try_claim<S: AppointmentStore + ?Sized>(
    store: &S,
    slot_id: Ulid,
    user_id: Ulid,
) -> Result<Appointment, EngineError> {
    let current = store
        .get(slot_id)
        .await?
        .ok_or(EngineError::NotFound(slot_id))?;
    if current.status != AppointmentStatus::Open {
        debug!("claim {slot_id} by {user_id}: slot is {}", current.status);
        return Err(EngineError::Conflict(slot_id));
    }

    match store
        .compare_and_swap(slot_id, AppointmentStatus::Open, StatusUpdate::Claim { user_id })
        .await?
    {
        CasOutcome::Swapped(appointment) => {
            info!("slot {slot_id} claimed by {user_id}");
            Ok(appointment)
        }
        CasOutcome::Stale(found) => {
            debug!("claim {slot_id} by {user_id}: lost race, slot is {}", found.status);
            Err(EngineError::Conflict(slot_id))
        }
    }
}

/// Where a caller's earlier claim stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimCheck {
    /// The caller is the claimant. The record may have moved on since (e.g. cancelled).
    Held(Appointment),
    /// Someone else claimed the slot.
    Lost,
    /// Nobody has claimed it; a fresh claim may be attempted.
    StillOpen,
}

/// Re-read a slot after an ambiguous claim (e.g. the response never arrived)
/// instead of assuming the attempt failed.
pub async fn check_claim<S: AppointmentStore + ?Sized>(
    store: &S,
    slot_id: Ulid,
    caller: Option<Ulid>,
) -> Result<ClaimCheck, EngineError> {
    let user_id = caller.ok_or(EngineError::Unauthorized("claim check requires a resolved identity"))?;
    let current = store
        .get(slot_id)
        .await?
        .ok_or(EngineError::NotFound(slot_id))?;
    Ok(match current.status {
        AppointmentStatus::Open => ClaimCheck::StillOpen,
        _ if current.user_id == Some(user_id) => ClaimCheck::Held(current),
        _ => ClaimCheck::Lost,
    })
}
