use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::api::rest::identity::{Caller, Role};
use crate::error::AppError;
use crate::geo::matcher;
use crate::models::driver::{Driver, GeoPoint};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver).get(list_drivers))
        .route("/drivers/nearby", get(nearby_drivers))
        .route("/drivers/:id/status", patch(update_driver_status))
        .route("/drivers/:id/location", patch(update_driver_location))
}

#[derive(Deserialize)]
pub struct RegisterDriverRequest {
    pub name: String,
    pub location: GeoPoint,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub is_online: bool,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

#[derive(Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: Option<f64>,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(payload): Json<RegisterDriverRequest>,
) -> Result<Json<Driver>, AppError> {
    caller.require(Role::Driver)?;

    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    payload.location.validate("location")?;

    let driver = Driver {
        id: caller.id,
        name: payload.name.trim().to_string(),
        location: payload.location,
        is_online: false,
        total_earning: 0.0,
        completed_jobs: 0,
        updated_at: Utc::now(),
    };

    state.store.insert_driver(driver.clone())?;
    info!(driver_id = %driver.id, "driver registered");
    Ok(Json(driver))
}

async fn list_drivers(State(state): State<Arc<AppState>>, caller: Caller) -> Result<Json<Vec<Driver>>, AppError> {
    caller.require(Role::Admin)?;
    Ok(Json(state.store.list_drivers()))
}

async fn nearby_drivers(
    State(state): State<Arc<AppState>>,
    _caller: Caller,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<Driver>>, AppError> {
    let point = GeoPoint::new(query.lat, query.lng);
    point.validate("point")?;

    let radius = query.radius_m.unwrap_or(state.match_radius_meters);
    if !radius.is_finite() || radius <= 0.0 {
        return Err(AppError::Validation("radius_m must be positive".to_string()));
    }

    Ok(Json(matcher::find_online_drivers_near(&state.store, &point, radius)))
}

async fn update_driver_status(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Driver>, AppError> {
    caller.require_self(id)?;

    let driver = state
        .store
        .update_driver(id, |driver| driver.is_online = payload.is_online)?;

    info!(driver_id = %id, is_online = driver.is_online, "driver status changed");
    Ok(Json(driver))
}

async fn update_driver_location(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Driver>, AppError> {
    caller.require_self(id)?;
    payload.location.validate("location")?;

    let driver = state
        .store
        .update_driver(id, |driver| driver.location = payload.location)?;

    Ok(Json(driver))
}
