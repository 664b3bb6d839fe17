use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Mirror an externally owned service so its provider can publish and cancel.
    /// The caller must be the provider being registered.
    pub async fn register_service(
        &self,
        id: Ulid,
        provider_id: Ulid,
        caller: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let caller = caller.ok_or(EngineError::Unauthorized("registration requires a resolved identity"))?;
        if caller != provider_id {
            return Err(EngineError::Unauthorized("services can only be registered by their provider"));
        }

        let _catalog = self.catalog_lock.lock().await;
        if self.state.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ServiceRegistered { id, provider_id };
        self.wal_append(vec![event.clone()]).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(ServiceState::new(id, provider_id))));
        self.notify.send(id, &event);
        tracing::info!("service {id} registered for provider {provider_id}");
        Ok(())
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// Holds every service's read lock until the swap is done, so no transition
    /// can be appended behind the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;

        let mut services: Vec<_> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        services.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(services.len());
        for (_, ss) in &services {
            guards.push(ss.clone().read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ServiceRegistered {
                id: guard.id,
                provider_id: guard.provider_id,
            });
            for a in &guard.appointments {
                events.push(Event::SlotPublished {
                    id: a.id,
                    service_id: a.service_id,
                    appointment_date: a.appointment_date,
                });
                if let Some(user_id) = a.user_id {
                    events.push(Event::SlotClaimed {
                        id: a.id,
                        service_id: a.service_id,
                        user_id,
                    });
                }
                let cancelled_by = match a.status {
                    AppointmentStatus::CancelledByUser => Some(Role::User),
                    AppointmentStatus::CancelledByService => Some(Role::Provider),
                    _ => None,
                };
                if let Some(by) = cancelled_by {
                    events.push(Event::AppointmentCancelled {
                        id: a.id,
                        service_id: a.service_id,
                        by,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }

    /// Every mirrored service, ordered by id.
    pub async fn list_services(&self) -> Vec<ServiceInfo> {
        let services: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(services.len());
        for ss in services {
            let guard = ss.read().await;
            out.push(ServiceInfo {
                id: guard.id,
                provider_id: guard.provider_id,
                appointment_count: guard.appointments.len(),
            });
        }
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
