//! Read-time classification of appointments and the persisted transition graph.
//!
//! DONE is never written. A SCHEDULED row whose date has been reached reads
//! as DONE wherever it is displayed or filtered, so no sweeper ever has to
//! rewrite rows as time passes.

use crate::model::{AppointmentStatus, Ms};

/// Status as shown to a reader at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectiveStatus {
    Open,
    Scheduled,
    Done,
    CancelledByUser,
    CancelledByService,
}

impl EffectiveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectiveStatus::Open => "open",
            EffectiveStatus::Scheduled => "scheduled",
            EffectiveStatus::Done => "done",
            EffectiveStatus::CancelledByUser => "cancelled_by_user",
            EffectiveStatus::CancelledByService => "cancelled_by_service",
        }
    }

    /// Still ahead of the claimant.
    pub fn is_upcoming(self) -> bool {
        self == EffectiveStatus::Scheduled
    }

    /// Belongs in a claimant's history.
    pub fn is_past(self) -> bool {
        matches!(
            self,
            EffectiveStatus::Done
                | EffectiveStatus::CancelledByUser
                | EffectiveStatus::CancelledByService
        )
    }
}

impl From<AppointmentStatus> for EffectiveStatus {
    fn from(status: AppointmentStatus) -> Self {
        match status {
            AppointmentStatus::Open => EffectiveStatus::Open,
            AppointmentStatus::Scheduled => EffectiveStatus::Scheduled,
            AppointmentStatus::Done => EffectiveStatus::Done,
            AppointmentStatus::CancelledByUser => EffectiveStatus::CancelledByUser,
            AppointmentStatus::CancelledByService => EffectiveStatus::CancelledByService,
        }
    }
}

impl std::fmt::Display for EffectiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single derivation point for "is this appointment still upcoming".
///
/// A SCHEDULED appointment reads as DONE from its `appointment_date` onwards
/// (`appointment_date <= now`). Every other status passes through unchanged.
pub fn effective_status(status: AppointmentStatus, appointment_date: Ms, now: Ms) -> EffectiveStatus {
    match status {
        AppointmentStatus::Scheduled if appointment_date <= now => EffectiveStatus::Done,
        other => other.into(),
    }
}

/// Persisted transitions: OPEN → SCHEDULED → CANCELLED_*. Nothing returns to OPEN.
pub fn can_transition(from: AppointmentStatus, to: AppointmentStatus) -> bool {
    use AppointmentStatus::*;
    matches!(
        (from, to),
        (Open, Scheduled) | (Scheduled, CancelledByUser) | (Scheduled, CancelledByService)
    )
}

/// Wall clock in unix ms. Only request handlers call this; everything below
/// them takes `now` as a parameter.
pub fn now_ms() -> Ms {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ms::try_from(elapsed.as_millis()).unwrap_or(Ms::MAX)
}
