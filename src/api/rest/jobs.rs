use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::rest::identity::{Caller, Role};
use crate::engine::lifecycle::{self, NewJob};
use crate::engine::settlement;
use crate::error::AppError;
use crate::models::driver::{Driver, GeoPoint};
use crate::models::job::{Job, JobKind};
use crate::models::payment::{Payment, PaymentMethod};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/candidates", get(list_candidates))
        .route("/jobs/:id/accept", post(accept_job))
        .route("/jobs/:id/decline", post(decline_job))
        .route("/jobs/:id/seats", post(book_seats))
        .route("/jobs/:id/start", post(start_trip))
        .route("/jobs/:id/close", post(request_close))
        .route("/jobs/:id/complete", post(complete_trip))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/otp", post(reissue_otp))
        .route("/jobs/:id/settle", post(settle_job))
        .route("/jobs/:id/payment", get(get_payment))
}

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub kind: JobKind,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub service_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub payment_method: String,
    pub seats_booked: Option<u32>,
}

#[derive(Deserialize)]
pub struct BookSeatsRequest {
    pub seats: u32,
}

#[derive(Deserialize)]
pub struct OtpRequest {
    pub otp: String,
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub otp: String,
    pub participant_id: Option<Uuid>,
}

/// Loads the job and checks the caller is one of its parties (or an admin).
fn load_for(state: &AppState, caller: &Caller, id: Uuid) -> Result<Job, AppError> {
    let job = state.store.get_job(id)?;
    if caller.is_admin() || job.is_party(caller.id) {
        Ok(job)
    } else {
        Err(AppError::Forbidden(format!("not a party to job {id}")))
    }
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(payload): Json<CreateJobRequest>,
) -> Result<Json<Job>, AppError> {
    let payment_method: PaymentMethod = payload.payment_method.parse()?;

    let job = lifecycle::create_job(
        &state,
        caller.id,
        NewJob {
            kind: payload.kind,
            pickup: payload.pickup,
            dropoff: payload.dropoff,
            service_id: payload.service_id,
            category_id: payload.category_id,
            payment_method,
            seats_booked: payload.seats_booked,
        },
    )
    .await?;

    Ok(Json(job.redacted_for(caller.id)))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    let job = load_for(&state, &caller, id)?;
    Ok(Json(job.redacted_for(caller.id)))
}

async fn list_candidates(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Driver>>, AppError> {
    load_for(&state, &caller, id)?;
    Ok(Json(lifecycle::candidates(&state, id)?))
}

async fn accept_job(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    caller.require(Role::Driver)?;
    let job = lifecycle::accept(&state, id, caller.id).await?;
    Ok(Json(job.redacted_for(caller.id)))
}

async fn decline_job(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    caller.require(Role::Driver)?;
    let job = lifecycle::decline(&state, id, caller.id).await?;
    Ok(Json(job.redacted_for(caller.id)))
}

async fn book_seats(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(payload): Json<BookSeatsRequest>,
) -> Result<Json<Job>, AppError> {
    let job = lifecycle::book_seats(&state, id, caller.id, payload.seats).await?;
    Ok(Json(job.redacted_for(caller.id)))
}

async fn start_trip(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(payload): Json<OtpRequest>,
) -> Result<Json<Job>, AppError> {
    caller.require(Role::Driver)?;
    let job = lifecycle::start(&state, id, caller.id, &payload.otp).await?;
    Ok(Json(job.redacted_for(caller.id)))
}

async fn request_close(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    caller.require(Role::Driver)?;
    let job = lifecycle::request_close(&state, id, caller.id).await?;
    Ok(Json(job.redacted_for(caller.id)))
}

async fn complete_trip(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
    Json(payload): Json<CompleteRequest>,
) -> Result<Json<Job>, AppError> {
    caller.require(Role::Driver)?;
    let job =
        lifecycle::complete(&state, id, caller.id, &payload.otp, payload.participant_id).await?;
    Ok(Json(job.redacted_for(caller.id)))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    let job = lifecycle::cancel(&state, id, caller.id).await?;
    Ok(Json(job.redacted_for(caller.id)))
}

async fn reissue_otp(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    caller.require(Role::Driver)?;
    let job = lifecycle::reissue_otp(&state, id, caller.id).await?;
    Ok(Json(job.redacted_for(caller.id)))
}

async fn settle_job(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, AppError> {
    load_for(&state, &caller, id)?;
    Ok(Json(settlement::settle(&state, id).await?))
}

async fn get_payment(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, AppError> {
    load_for(&state, &caller, id)?;
    state
        .store
        .payment_for_job(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no payment for job {id}")))
}
