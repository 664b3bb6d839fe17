use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ulid::Ulid;

use crate::lifecycle::can_transition;
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// The change a conditional update writes when its expectation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Claim { user_id: Ulid },
    Cancel { by: Role },
}

impl StatusUpdate {
    pub fn target(&self) -> AppointmentStatus {
        match self {
            StatusUpdate::Claim { .. } => AppointmentStatus::Scheduled,
            StatusUpdate::Cancel { by } => by.cancelled_status(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written; carries the record as it now stands.
    Swapped(Appointment),
    /// The persisted status no longer matched; carries the record as found.
    Stale(Appointment),
}

/// Durable appointment storage as seen by the lifecycle operations.
///
/// `compare_and_swap` is the only write that touches an existing row and must
/// be atomic per row: of any number of concurrent calls expecting the same
/// status, at most one observes `Swapped`.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn get(&self, id: Ulid) -> Result<Option<Appointment>, EngineError>;

    /// Every row of a service, soonest first. `NotFound` for an unknown service.
    async fn list_by_service(&self, service_id: Ulid) -> Result<Vec<Appointment>, EngineError>;

    /// OPEN rows of a service at or after `from`, soonest first.
    async fn list_open_by_service(
        &self,
        service_id: Ulid,
        from: Option<Ms>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let mut slots = self.list_by_service(service_id).await?;
        slots.retain(|a| {
            a.status == AppointmentStatus::Open && from.is_none_or(|t| a.appointment_date >= t)
        });
        Ok(slots)
    }

    /// Every row ever claimed by `user_id`.
    async fn list_by_user(&self, user_id: Ulid) -> Result<Vec<Appointment>, EngineError>;

    async fn service_provider(&self, service_id: Ulid) -> Result<Option<Ulid>, EngineError>;

    /// Create OPEN rows, all or nothing.
    async fn create_slots(
        &self,
        service_id: Ulid,
        slots: &[(Ulid, Ms)],
    ) -> Result<Vec<Appointment>, EngineError>;

    async fn compare_and_swap(
        &self,
        id: Ulid,
        expected: AppointmentStatus,
        update: StatusUpdate,
    ) -> Result<CasOutcome, EngineError>;
}

#[async_trait]
impl AppointmentStore for Engine {
    async fn get(&self, id: Ulid) -> Result<Option<Appointment>, EngineError> {
        let Some(service_id) = self.get_service_for_appointment(&id) else {
            return Ok(None);
        };
        let Some(ss) = self.get_service(&service_id) else {
            return Ok(None);
        };
        let guard = ss.read().await;
        Ok(guard.get(&id).cloned())
    }

    async fn list_by_service(&self, service_id: Ulid) -> Result<Vec<Appointment>, EngineError> {
        let ss = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        let guard = ss.read().await;
        Ok(guard.appointments.clone())
    }

    async fn list_open_by_service(
        &self,
        service_id: Ulid,
        from: Option<Ms>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let ss = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        let guard = ss.read().await;
        Ok(guard.open_slots(from).cloned().collect())
    }

    async fn list_by_user(&self, user_id: Ulid) -> Result<Vec<Appointment>, EngineError> {
        let ids: Vec<Ulid> = self
            .by_user
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(appointment) = self.get(id).await?
                && appointment.user_id == Some(user_id)
            {
                out.push(appointment);
            }
        }
        Ok(out)
    }

    async fn service_provider(&self, service_id: Ulid) -> Result<Option<Ulid>, EngineError> {
        let Some(ss) = self.get_service(&service_id) else {
            return Ok(None);
        };
        let guard = ss.read().await;
        Ok(Some(guard.provider_id))
    }

    async fn create_slots(
        &self,
        service_id: Ulid,
        slots: &[(Ulid, Ms)],
    ) -> Result<Vec<Appointment>, EngineError> {
        let ss = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        let mut guard = ss.write().await;
        if guard.appointments.len() + slots.len() > MAX_APPOINTMENTS_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many appointments on service"));
        }

        // Phase 1: validate against current state + intra-batch. Ids are
        // reserved before the lookup so a publish to another service cannot
        // take the same id between check and apply.
        let mut reservation = IdReservation::new(&self.reserved_ids);
        let mut batch_dates = HashSet::with_capacity(slots.len());
        for &(id, appointment_date) in slots {
            if !reservation.reserve(id) || self.appointment_to_service.contains_key(&id) {
                return Err(EngineError::AlreadyExists(id));
            }
            if guard.live_slot_at(appointment_date).is_some() || !batch_dates.insert(appointment_date) {
                return Err(EngineError::SlotTaken {
                    service_id,
                    appointment_date,
                });
            }
        }

        if slots.is_empty() {
            return Ok(Vec::new());
        }

        // Phase 2: one WAL commit for the whole batch, applied only once durable.
        let events = slots
            .iter()
            .map(|&(id, appointment_date)| Event::SlotPublished {
                id,
                service_id,
                appointment_date,
            })
            .collect();
        self.persist_and_apply_all(&mut guard, events).await?;
        Ok(slots
            .iter()
            .map(|&(id, appointment_date)| Appointment::open(id, service_id, appointment_date))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        id: Ulid,
        expected: AppointmentStatus,
        update: StatusUpdate,
    ) -> Result<CasOutcome, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status != expected {
            return Ok(CasOutcome::Stale(current));
        }
        if !can_transition(expected, update.target()) {
            return Err(EngineError::InvalidState {
                id,
                status: expected.into(),
            });
        }

        let event = match update {
            StatusUpdate::Claim { user_id } => Event::SlotClaimed {
                id,
                service_id: current.service_id,
                user_id,
            },
            StatusUpdate::Cancel { by } => Event::AppointmentCancelled {
                id,
                service_id: current.service_id,
                by,
            },
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        Ok(CasOutcome::Swapped(updated))
    }
}

/// Appointment ids held by one in-flight publish; released on drop.
struct IdReservation<'a> {
    reserved: &'a DashMap<Ulid, ()>,
    ids: Vec<Ulid>,
}

impl<'a> IdReservation<'a> {
    fn new(reserved: &'a DashMap<Ulid, ()>) -> Self {
        Self {
            reserved,
            ids: Vec::new(),
        }
    }

    /// False if the id is already held, by this batch or another.
    fn reserve(&mut self, id: Ulid) -> bool {
        match self.reserved.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(());
                self.ids.push(id);
                true
            }
        }
    }
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.reserved.remove(id);
        }
    }
}
