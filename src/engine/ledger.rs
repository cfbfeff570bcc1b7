use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::engine::fare::round2;
use crate::error::AppError;
use crate::models::ledger::{EarningsSummary, LedgerEntry, RiderStats};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct DailyRevenue {
    pub date: NaiveDate,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformRevenue {
    pub days: Vec<DailyRevenue>,
    pub total: f64,
}

fn ensure_range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<(), AppError> {
    match (from, to) {
        (Some(from), Some(to)) if from > to => Err(AppError::Validation(format!(
            "from ({from}) must not be after to ({to})"
        ))),
        _ => Ok(()),
    }
}

pub fn earnings(
    state: &AppState,
    driver_id: Uuid,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<EarningsSummary, AppError> {
    ensure_range(from, to)?;
    state.store.get_driver(driver_id)?;

    let entries = state.store.ledger_entries(driver_id, from, to);
    Ok(EarningsSummary::from_entries(driver_id, entries))
}

/// Moves `amount` of the day's available earning into the wallet.
pub fn withdraw(
    state: &AppState,
    driver_id: Uuid,
    date: NaiveDate,
    amount: f64,
) -> Result<LedgerEntry, AppError> {
    let entry = state
        .store
        .with_ledger_entry(driver_id, date, |entry| {
            entry.withdraw(amount).map(|()| entry.clone())
        })??;

    info!(
        driver_id = %driver_id,
        date = %date,
        amount,
        available_earning = entry.available_earning(),
        "earnings withdrawn to wallet"
    );
    Ok(entry)
}

pub fn rider_stats(state: &AppState, rider_id: Uuid) -> RiderStats {
    state.store.rider_stats(rider_id)
}

pub fn platform_revenue(
    state: &AppState,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<PlatformRevenue, AppError> {
    ensure_range(from, to)?;

    let days: Vec<DailyRevenue> = state
        .store
        .platform_revenue()
        .into_iter()
        .filter(|(date, _)| from.is_none_or(|from| *date >= from) && to.is_none_or(|to| *date <= to))
        .map(|(date, amount)| DailyRevenue { date, amount })
        .collect();
    let total = round2(days.iter().map(|day| day.amount).sum());

    Ok(PlatformRevenue { days, total })
}
