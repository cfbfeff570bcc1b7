use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::rest::identity::{Caller, Role};
use crate::engine::ledger::{self, PlatformRevenue};
use crate::error::AppError;
use crate::models::ledger::{EarningsSummary, LedgerEntry, RiderStats};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers/:id/ledger", get(driver_ledger))
        .route("/drivers/:id/ledger/withdraw", post(withdraw))
        .route("/riders/:id/stats", get(rider_stats))
        .route("/platform/revenue", get(platform_revenue))
}

#[derive(Deserialize)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct WithdrawRequest {
    pub date: NaiveDate,
    pub amount: f64,
}

async fn driver_ledger(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Query(range): Query<DateRange>,
) -> Result<Json<EarningsSummary>, AppError> {
    caller.require_self(id)?;
    Ok(Json(ledger::earnings(&state, id, range.from, range.to)?))
}

async fn withdraw(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(payload): Json<WithdrawRequest>,
) -> Result<Json<LedgerEntry>, AppError> {
    caller.require(Role::Driver)?;
    caller.require_self(id)?;
    Ok(Json(ledger::withdraw(&state, id, payload.date, payload.amount)?))
}

async fn rider_stats(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<RiderStats>, AppError> {
    caller.require_self(id)?;
    Ok(Json(ledger::rider_stats(&state, id)))
}

async fn platform_revenue(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(range): Query<DateRange>,
) -> Result<Json<PlatformRevenue>, AppError> {
    caller.require(Role::Admin)?;
    Ok(Json(ledger::platform_revenue(&state, range.from, range.to)?))
}
