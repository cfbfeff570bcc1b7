use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    JobOffered,
    JobAccepted,
    JobDeclined,
    SeatsBooked,
    StartOtp,
    TripStarted,
    CloseOtp,
    JobCompleted,
    JobCancelled,
    PaymentSettled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub receiver_id: Uuid,
    pub kind: NotificationKind,
    pub text: String,
    pub job_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    pub sent_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(receiver_id: Uuid, kind: NotificationKind, job_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            receiver_id,
            kind,
            text: text.into(),
            job_id,
            otp: None,
            amount: None,
            sent_at: Utc::now(),
        }
    }

    pub fn with_otp(mut self, otp: &str) -> Self {
        self.otp = Some(otp.to_string());
        self
    }

    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }
}
