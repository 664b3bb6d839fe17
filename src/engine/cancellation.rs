use tracing::info;
use ulid::Ulid;

use crate::lifecycle::{effective_status, EffectiveStatus};
use crate::model::*;

use super::{AppointmentStore, CasOutcome, EngineError, StatusUpdate};

/// Cancel a SCHEDULED appointment that has not yet been reached at `now`.
///
/// The claimant cancels as [`Role::User`], the owning provider as
/// [`Role::Provider`]. The slot is retired, never reopened. A second cancel
/// returns `InvalidState`.
pub async fn cancel<S: AppointmentStore + ?Sized>(
    store: &S,
    appointment_id: Ulid,
    caller: Option<Ulid>,
    role: Role,
    now: Ms,
) -> Result<Appointment, EngineError> {
    let result = try_cancel(store, appointment_id, caller, role, now).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(EngineError::InvalidState { .. }) => "invalid_state",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::Unauthorized(_)) => "unauthorized",
        Err(_) => "error",
    };
    metrics::counter!(
        crate::observability::CANCELLATIONS_TOTAL,
        "role" => role.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    result
}

async fn try_cancel<S: AppointmentStore + ?Sized>(
    store: &S,
    id: Ulid,
    caller: Option<Ulid>,
    role: Role,
    now: Ms,
) -> Result<Appointment, EngineError> {
    let caller = caller.ok_or(EngineError::Unauthorized("cancel requires a resolved identity"))?;
    let current = store.get(id).await?.ok_or(EngineError::NotFound(id))?;

    let effective = effective_status(current.status, current.appointment_date, now);
    if effective != EffectiveStatus::Scheduled {
        return Err(EngineError::InvalidState {
            id,
            status: effective,
        });
    }

    authorize(store, &current, caller, role).await?;

    match store
        .compare_and_swap(id, AppointmentStatus::Scheduled, StatusUpdate::Cancel { by: role })
        .await?
    {
        CasOutcome::Swapped(appointment) => {
            info!("appointment {id} cancelled by {} {caller}", role.as_str());
            Ok(appointment)
        }
        CasOutcome::Stale(found) => Err(EngineError::InvalidState {
            id,
            status: effective_status(found.status, found.appointment_date, now),
        }),
    }
}

async fn authorize<S: AppointmentStore + ?Sized>(
    store: &S,
    appointment: &Appointment,
    caller: Ulid,
    role: Role,
) -> Result<(), EngineError> {
    match role {
        Role::User if appointment.user_id == Some(caller) => Ok(()),
        Role::User => Err(EngineError::Unauthorized("only the claimant may cancel as user")),
        Role::Provider => {
            let provider = store.service_provider(appointment.service_id).await?;
            if provider == Some(caller) {
                Ok(())
            } else {
                Err(EngineError::Unauthorized("only the owning provider may cancel as provider"))
            }
        }
    }
}
