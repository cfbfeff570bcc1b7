use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Card,
    Offline,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "CARD",
            PaymentMethod::Offline => "OFFLINE",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CARD" => Ok(PaymentMethod::Card),
            "OFFLINE" | "CASH" => Ok(PaymentMethod::Offline),
            other => Err(AppError::Validation(format!(
                "unknown payment method: {other}, expected CARD/OFFLINE"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    /// A settlement holds the job while its payment session is opened.
    Processing,
    Paid,
    Failed,
}

/// Settlement outcome for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub job_id: Uuid,
    pub payer_id: Uuid,
    pub driver_id: Uuid,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: f64,
    pub driver_share: f64,
    pub platform_share: f64,
    pub external_transaction_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}
