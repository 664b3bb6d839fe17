mod booking;
mod cancellation;
mod error;
mod mutations;
mod publishing;
mod queries;
mod store;

pub use booking::{check_claim, claim, ClaimCheck};
pub use cancellation::cancel;
pub use error::EngineError;
pub use publishing::publish_slots;
pub use queries::{get_appointment, list_open_slots, my_appointments};
pub use store::{AppointmentStore, CasOutcome, StatusUpdate};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedServiceState = Arc<RwLock<ServiceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events that become durable together or not at all.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_maintenance(&mut wal, other);
                }
            }
            other => handle_maintenance(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    let event_count: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(event_count as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {event_count} events: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Stage every event of the batch, then one fsync. A failure anywhere leaves
/// none of the batch in the log.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    for event in batch.iter().flat_map(|(events, _)| events) {
        if let Err(e) = wal.append_buffered(event) {
            wal.discard_staged();
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn handle_maintenance(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            commit_batch(wal, &mut vec![(events, response)]);
        }
    }
}

/// In-memory appointment store made durable by a write-ahead log.
///
/// Each service's appointments sit behind one `RwLock`. Every persisted
/// transition happens under that service's write lock: read current status,
/// append to the WAL, apply, notify. That lock is the compare-and-swap
/// primitive claims serialize through.
pub struct Engine {
    pub state: DashMap<Ulid, SharedServiceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: appointment id → service id
    pub(super) appointment_to_service: DashMap<Ulid, Ulid>,
    /// Claimant → appointment ids.
    pub(super) by_user: DashMap<Ulid, Vec<Ulid>>,
    /// Serializes registration and compaction.
    pub(super) catalog_lock: Mutex<()>,
    /// Appointment ids reserved by an in-flight publish, not yet applied.
    pub(super) reserved_ids: DashMap<Ulid, ()>,
}

/// Apply an event directly to a ServiceState (caller holds the lock).
fn apply_to_service(
    ss: &mut ServiceState,
    event: &Event,
    appointment_map: &DashMap<Ulid, Ulid>,
    by_user: &DashMap<Ulid, Vec<Ulid>>,
) {
    match event {
        Event::SlotPublished {
            id,
            service_id,
            appointment_date,
        } => {
            ss.insert_appointment(Appointment::open(*id, *service_id, *appointment_date));
            appointment_map.insert(*id, *service_id);
        }
        Event::SlotClaimed { id, user_id, .. } => {
            if let Some(appointment) = ss.get_mut(id) {
                appointment.user_id = Some(*user_id);
                appointment.status = AppointmentStatus::Scheduled;
                by_user.entry(*user_id).or_default().push(*id);
            }
        }
        Event::AppointmentCancelled { id, by, .. } => {
            if let Some(appointment) = ss.get_mut(id) {
                appointment.status = by.cancelled_status();
            }
        }
        // Handled at the DashMap level, not here
        Event::ServiceRegistered { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (events, wal) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let appointment_to_service = DashMap::new();
        let by_user = DashMap::new();

        // Rebuild plain state first; nothing is shared until replay is done.
        let mut services: HashMap<Ulid, ServiceState> = HashMap::new();
        for event in &events {
            match event {
                Event::ServiceRegistered { id, provider_id } => {
                    services.insert(*id, ServiceState::new(*id, *provider_id));
                }
                other => {
                    if let Some(ss) = services.get_mut(&other.service_id()) {
                        apply_to_service(ss, other, &appointment_to_service, &by_user);
                    }
                }
            }
        }

        let state = DashMap::new();
        for (id, ss) in services {
            state.insert(id, Arc::new(RwLock::new(ss)));
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events into {} services from {}",
                events.len(),
                state.len(),
                wal_path.display()
            );
        }

        Ok(Self {
            state,
            wal_tx,
            notify,
            appointment_to_service,
            by_user,
            catalog_lock: Mutex::new(()),
            reserved_ids: DashMap::new(),
        })
    }

    /// Write events to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_service(&self, id: &Ulid) -> Option<SharedServiceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_service_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_to_service
            .get(appointment_id)
            .map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut ServiceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(vec![event.clone()]).await?;
        apply_to_service(ss, event, &self.appointment_to_service, &self.by_user);
        self.notify.send(event.service_id(), event);
        Ok(())
    }

    /// Persist a batch in one WAL commit, then apply and notify every event.
    /// Nothing is applied unless the whole batch is durable.
    pub(super) async fn persist_and_apply_all(
        &self,
        ss: &mut ServiceState,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        self.wal_append(events.clone()).await?;
        for event in &events {
            apply_to_service(ss, event, &self.appointment_to_service, &self.by_user);
            self.notify.send(event.service_id(), event);
        }
        Ok(())
    }

    /// Lookup appointment → service, get service, acquire write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ServiceState>, EngineError> {
        let service_id = self
            .get_service_for_appointment(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let ss = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        Ok(ss.write_owned().await)
    }
}
