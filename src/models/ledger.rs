use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::fare::round2;
use crate::error::AppError;
use crate::models::payment::PaymentMethod;

/// Per-driver, per-day earnings aggregate.
///
/// `available_earning` is derived; every mutator recomputes it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LedgerEntry {
    pub driver_id: Uuid,
    pub date: NaiveDate,
    pub total_earning: f64,
    pub cash_received: f64,
    pub online_payment_received: f64,
    pub wallet_amount: f64,
    available_earning: f64,
}

impl LedgerEntry {
    pub fn new(driver_id: Uuid, date: NaiveDate) -> Self {
        Self {
            driver_id,
            date,
            total_earning: 0.0,
            cash_received: 0.0,
            online_payment_received: 0.0,
            wallet_amount: 0.0,
            available_earning: 0.0,
        }
    }

    pub fn available_earning(&self) -> f64 {
        self.available_earning
    }

    pub fn credit(&mut self, method: PaymentMethod, driver_share: f64) {
        self.total_earning = round2(self.total_earning + driver_share);
        match method {
            PaymentMethod::Offline => {
                self.cash_received = round2(self.cash_received + driver_share);
            }
            PaymentMethod::Card => {
                self.online_payment_received =
                    round2(self.online_payment_received + driver_share);
            }
        }
        self.recompute();
    }

    pub fn withdraw(&mut self, amount: f64) -> Result<(), AppError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(AppError::Validation(
                "withdrawal amount must be positive".to_string(),
            ));
        }
        if amount > self.available_earning + f64::EPSILON {
            return Err(AppError::Validation(format!(
                "withdrawal of {amount} exceeds available earning {}",
                self.available_earning
            )));
        }

        self.wallet_amount = round2(self.wallet_amount + amount);
        self.recompute();
        Ok(())
    }

    fn recompute(&mut self) {
        self.available_earning = round2(self.total_earning - self.wallet_amount);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiderStats {
    pub rider_id: Uuid,
    pub trip_count: u64,
    pub total_spent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EarningsSummary {
    pub driver_id: Uuid,
    pub entries: Vec<LedgerEntry>,
    pub total_earning: f64,
    pub cash_received: f64,
    pub online_payment_received: f64,
    pub wallet_amount: f64,
    pub available_earning: f64,
}

impl EarningsSummary {
    pub fn from_entries(driver_id: Uuid, mut entries: Vec<LedgerEntry>) -> Self {
        entries.sort_by_key(|entry| entry.date);

        let sum = |field: fn(&LedgerEntry) -> f64| round2(entries.iter().map(field).sum());

        Self {
            driver_id,
            total_earning: sum(|e| e.total_earning),
            cash_received: sum(|e| e.cash_received),
            online_payment_received: sum(|e| e.online_payment_received),
            wallet_amount: sum(|e| e.wallet_amount),
            available_earning: sum(|e| e.available_earning),
            entries,
        }
    }
}
