use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::api::rest::identity::{Caller, Role};
use crate::error::AppError;
use crate::models::rates::{Category, Service};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/services", post(create_service).get(list_services))
        .route("/categories", post(create_category).get(list_categories))
}

#[derive(Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub base_fare: f64,
}

#[derive(Deserialize)]
pub struct CreateCategoryRequest {
    pub service_id: Uuid,
    pub name: String,
    pub base_price: f64,
    pub rate_per_km: f64,
    pub rate_per_hour: f64,
    pub seat_capacity: u32,
}

fn non_negative(field: &str, value: f64) -> Result<(), AppError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "{field} must be a non-negative number"
        )))
    }
}

fn non_empty(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    Ok(name.to_string())
}

async fn create_service(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(payload): Json<CreateServiceRequest>,
) -> Result<Json<Service>, AppError> {
    caller.require(Role::Admin)?;
    non_negative("base_fare", payload.base_fare)?;

    let service = Service {
        id: Uuid::new_v4(),
        name: non_empty(&payload.name)?,
        base_fare: payload.base_fare,
    };

    state.store.insert_service(service.clone());
    info!(service_id = %service.id, name = %service.name, "service created");
    Ok(Json(service))
}

async fn list_services(State(state): State<Arc<AppState>>) -> Json<Vec<Service>> {
    Json(state.store.list_services())
}

async fn create_category(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(payload): Json<CreateCategoryRequest>,
) -> Result<Json<Category>, AppError> {
    caller.require(Role::Admin)?;
    non_negative("base_price", payload.base_price)?;
    non_negative("rate_per_km", payload.rate_per_km)?;
    non_negative("rate_per_hour", payload.rate_per_hour)?;
    if payload.seat_capacity == 0 {
        return Err(AppError::Validation("seat_capacity must be > 0".to_string()));
    }

    state.store.get_service(payload.service_id)?;

    let category = Category {
        id: Uuid::new_v4(),
        service_id: payload.service_id,
        name: non_empty(&payload.name)?,
        base_price: payload.base_price,
        rate_per_km: payload.rate_per_km,
        rate_per_hour: payload.rate_per_hour,
        seat_capacity: payload.seat_capacity,
    };

    state.store.insert_category(category.clone());
    info!(category_id = %category.id, service_id = %category.service_id, "category created");
    Ok(Json(category))
}

async fn list_categories(State(state): State<Arc<AppState>>) -> Json<Vec<Category>> {
    Json(state.store.list_categories())
}
