use ulid::Ulid;

use crate::model::*;
use crate::partition::{partition, Partition};

use super::{AppointmentStore, EngineError};

/// OPEN slots of a service at or after `from`, soonest first.
pub async fn list_open_slots<S: AppointmentStore + ?Sized>(
    store: &S,
    service_id: Ulid,
    from: Option<Ms>,
) -> Result<Vec<Appointment>, EngineError> {
    store.list_open_by_service(service_id, from).await
}

pub async fn get_appointment<S: AppointmentStore + ?Sized>(
    store: &S,
    id: Ulid,
) -> Result<Appointment, EngineError> {
    store.get(id).await?.ok_or(EngineError::NotFound(id))
}

/// The caller's appointments split into upcoming and past as of `now`.
pub async fn my_appointments<S: AppointmentStore + ?Sized>(
    store: &S,
    caller: Option<Ulid>,
    now: Ms,
) -> Result<Partition, EngineError> {
    let user_id = caller.ok_or(EngineError::Unauthorized("listing requires a resolved identity"))?;
    let appointments = store.list_by_user(user_id).await?;
    Ok(partition(appointments, now))
}
