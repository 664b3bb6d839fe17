use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{AppointmentStore, EngineError};

fn validate_timestamp(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Publish OPEN slots for a service. Only its provider may publish.
///
/// All-or-nothing: a duplicate id or a time already held by an OPEN or
/// SCHEDULED row rejects the whole batch.
pub async fn publish_slots<S: AppointmentStore + ?Sized>(
    store: &S,
    caller: Option<Ulid>,
    service_id: Ulid,
    slots: &[(Ulid, Ms)],
) -> Result<Vec<Appointment>, EngineError> {
    let caller = caller.ok_or(EngineError::Unauthorized("publishing requires a resolved identity"))?;
    if slots.is_empty() {
        return Ok(Vec::new());
    }
    if slots.len() > MAX_BATCH_SIZE {
        return Err(EngineError::LimitExceeded("batch too large"));
    }
    for (_, appointment_date) in slots {
        validate_timestamp(*appointment_date)?;
    }

    let provider = store
        .service_provider(service_id)
        .await?
        .ok_or(EngineError::NotFound(service_id))?;
    if provider != caller {
        return Err(EngineError::Unauthorized("only the owning provider may publish slots"));
    }

    let created = store.create_slots(service_id, slots).await?;
    metrics::counter!(crate::observability::SLOTS_PUBLISHED_TOTAL).increment(created.len() as u64);
    info!("published {} slots for service {service_id}", created.len());
    Ok(created)
}
