use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::GeoPoint;
use crate::models::payment::{PaymentMethod, PaymentStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Ride,
    Package,
    SharedRide,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Ride => "RIDE",
            JobKind::Package => "PACKAGE",
            JobKind::SharedRide => "SHARED_RIDE",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Requested,
    Accepted,
    InProgress,
    Closing,
    Completed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }

    /// The full transition table. Anything not listed here is rejected.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, next),
            (Requested, Accepted)
                | (Requested, Cancelled)
                | (Accepted, InProgress)
                | (Accepted, Cancelled)
                | (InProgress, Closing)
                | (Closing, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Requested => "REQUESTED",
            JobState::Accepted => "ACCEPTED",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Closing => "CLOSING",
            JobState::Completed => "COMPLETED",
            JobState::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtpPurpose {
    Start,
    Close,
}

/// A pending confirmation code. Always a fixed-width digit string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OtpCode {
    pub code: String,
    pub purpose: OtpPurpose,
    pub issued_at: DateTime<Utc>,
}

impl OtpCode {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Option<chrono::Duration>) -> bool {
        match ttl {
            Some(ttl) => now - self.issued_at > ttl,
            None => false,
        }
    }
}

/// One occupant of a shared ride.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub user_id: Uuid,
    pub seats_booked: u32,
    pub otp: Option<OtpCode>,
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub requester_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub service_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub distance_km: f64,
    pub duration_min: f64,
    pub fare: f64,
    pub state: JobState,
    pub otp: Option<OtpCode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<Participant>,
    pub seats_available: u32,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub rejected_driver_ids: BTreeSet<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_shared(&self) -> bool {
        self.kind == JobKind::SharedRide
    }

    pub fn participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: Uuid) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn all_participants_verified(&self) -> bool {
        self.participants.iter().all(|p| p.verified)
    }

    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.requester_id == user_id
            || self.driver_id == Some(user_id)
            || self.participant(user_id).is_some()
    }

    /// Copy of the job as seen by `viewer`: codes are only visible to the
    /// party who has to read them out to the driver.
    pub fn redacted_for(&self, viewer: Uuid) -> Job {
        let mut view = self.clone();
        if view.requester_id != viewer {
            view.otp = None;
        }
        for participant in &mut view.participants {
            if participant.user_id != viewer {
                participant.otp = None;
            }
        }
        view
    }
}
