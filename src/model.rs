use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Persisted status of an appointment. The ordinal is the stored representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AppointmentStatus {
    Open = 0,
    Scheduled = 1,
    /// Never written by this crate; only reachable through the classifier.
    Done = 2,
    CancelledByUser = 3,
    CancelledByService = 4,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 5] = [
        AppointmentStatus::Open,
        AppointmentStatus::Scheduled,
        AppointmentStatus::Done,
        AppointmentStatus::CancelledByUser,
        AppointmentStatus::CancelledByService,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(n: u8) -> Option<Self> {
        Self::ALL.get(usize::from(n)).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Open => "open",
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Done => "done",
            AppointmentStatus::CancelledByUser => "cancelled_by_user",
            AppointmentStatus::CancelledByService => "cancelled_by_service",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
    }

    pub fn is_cancelled(self) -> bool {
        matches!(
            self,
            AppointmentStatus::CancelledByUser | AppointmentStatus::CancelledByService
        )
    }

    /// A claimant is attached in every status except `Open`.
    pub fn carries_claimant(self) -> bool {
        !matches!(self, AppointmentStatus::Open)
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is acting on an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The claimant.
    User,
    /// The provider owning the appointment's service.
    Provider,
}

impl Role {
    /// Terminal status written when this role cancels.
    pub fn cancelled_status(self) -> AppointmentStatus {
        match self {
            Role::User => AppointmentStatus::CancelledByUser,
            Role::Provider => AppointmentStatus::CancelledByService,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub service_id: Ulid,
    /// Set exactly once, by a successful claim.
    pub user_id: Option<Ulid>,
    pub appointment_date: Ms,
    pub status: AppointmentStatus,
}

impl Appointment {
    pub fn open(id: Ulid, service_id: Ulid, appointment_date: Ms) -> Self {
        Self {
            id,
            service_id,
            user_id: None,
            appointment_date,
            status: AppointmentStatus::Open,
        }
    }

    /// OPEN or SCHEDULED rows occupy their (service, date) slot.
    pub fn occupies_slot(&self) -> bool {
        matches!(
            self.status,
            AppointmentStatus::Open | AppointmentStatus::Scheduled
        )
    }
}

/// All appointments of one service, guarded together by the service lock.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub id: Ulid,
    pub provider_id: Ulid,
    /// Sorted by `appointment_date`.
    pub appointments: Vec<Appointment>,
}

impl ServiceState {
    pub fn new(id: Ulid, provider_id: Ulid) -> Self {
        Self {
            id,
            provider_id,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `appointment_date`.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.appointment_date <= appointment.appointment_date);
        self.appointments.insert(pos, appointment);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Rows sharing `date`, found by binary search.
    pub fn at(&self, date: Ms) -> impl Iterator<Item = &Appointment> {
        let lo = self.appointments.partition_point(|a| a.appointment_date < date);
        let hi = self.appointments.partition_point(|a| a.appointment_date <= date);
        self.appointments[lo..hi].iter()
    }

    /// The OPEN or SCHEDULED row holding `date`, if any.
    pub fn live_slot_at(&self, date: Ms) -> Option<&Appointment> {
        self.at(date).find(|a| a.occupies_slot())
    }

    /// OPEN rows at or after `from`, soonest first.
    pub fn open_slots(&self, from: Option<Ms>) -> impl Iterator<Item = &Appointment> {
        let start = from.map_or(0, |t| self.appointments.partition_point(|a| a.appointment_date < t));
        self.appointments[start..]
            .iter()
            .filter(|a| a.status == AppointmentStatus::Open)
    }
}

/// WAL record format. One variant per persisted transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceRegistered {
        id: Ulid,
        provider_id: Ulid,
    },
    SlotPublished {
        id: Ulid,
        service_id: Ulid,
        appointment_date: Ms,
    },
    SlotClaimed {
        id: Ulid,
        service_id: Ulid,
        user_id: Ulid,
    },
    AppointmentCancelled {
        id: Ulid,
        service_id: Ulid,
        by: Role,
    },
}

impl Event {
    /// Channel key the event is broadcast on.
    pub fn service_id(&self) -> Ulid {
        match self {
            Event::ServiceRegistered { id, .. } => *id,
            Event::SlotPublished { service_id, .. }
            | Event::SlotClaimed { service_id, .. }
            | Event::AppointmentCancelled { service_id, .. } => *service_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub appointment_count: usize,
}
