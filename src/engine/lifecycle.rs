use std::collections::BTreeSet;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::fare::{self, FareQuote};
use crate::engine::otp::{self, GateCheck};
use crate::engine::settlement;
use crate::error::AppError;
use crate::geo::matcher;
use crate::models::driver::{Driver, GeoPoint};
use crate::models::job::{Job, JobKind, JobState, OtpPurpose, Participant};
use crate::models::notification::{Notification, NotificationKind};
use crate::models::payment::{PaymentMethod, PaymentStatus};
use crate::models::rates::Category;
use crate::state::AppState;
use crate::store::StoreError;

#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub kind: JobKind,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub service_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub payment_method: PaymentMethod,
    pub seats_booked: Option<u32>,
}

fn ensure_transition(current: JobState, next: JobState, operation: &str) -> Result<(), AppError> {
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(AppError::invalid_state(operation))
    }
}

/// The only place a job's state is written.
fn advance(job: &mut Job, next: JobState) {
    let now = Utc::now();
    job.state = next;
    match next {
        JobState::Accepted => job.accepted_at = Some(now),
        JobState::InProgress => job.started_at = Some(now),
        JobState::Completed => job.completed_at = Some(now),
        JobState::Cancelled => job.cancelled_at = Some(now),
        JobState::Requested | JobState::Closing => {}
    }
}

fn ensure_assigned(job: &Job, driver_id: Uuid) -> Result<(), AppError> {
    if job.driver_id == Some(driver_id) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "driver {driver_id} is not assigned to job {}",
            job.id
        )))
    }
}

fn conflict(err: StoreError, message: impl Into<String>) -> AppError {
    match err {
        StoreError::Conflict(_) => AppError::Conflict(message.into()),
        other => other.into(),
    }
}

fn otp_notifications(job_id: Uuid, kind: NotificationKind, deliveries: &[(Uuid, String)]) -> Vec<Notification> {
    let text = match kind {
        NotificationKind::StartOtp => "share this code with your driver to start the trip",
        _ => "share this code with your driver to finish the trip",
    };

    deliveries
        .iter()
        .map(|(receiver, code)| Notification::new(*receiver, kind, job_id, text).with_otp(code))
        .collect()
}

fn validate_seats(seats: u32, available: u32) -> Result<(), AppError> {
    if seats == 0 {
        return Err(AppError::Validation("seats must be at least 1".to_string()));
    }
    if seats > available {
        return Err(AppError::Validation(format!(
            "requested {seats} seats but only {available} available"
        )));
    }
    Ok(())
}

fn rate_table(
    state: &AppState,
    request: &NewJob,
) -> Result<(crate::models::rates::Service, Category), AppError> {
    let service_id = request
        .service_id
        .ok_or_else(|| AppError::Validation("service_id is required for rides".to_string()))?;
    let category_id = request
        .category_id
        .ok_or_else(|| AppError::Validation("category_id is required for rides".to_string()))?;

    let service = state.store.get_service(service_id)?;
    let category = state.store.get_category(category_id)?;
    if category.service_id != service.id {
        return Err(AppError::Validation(format!(
            "category {category_id} does not belong to service {service_id}"
        )));
    }

    Ok((service, category))
}

pub async fn create_job(state: &AppState, requester_id: Uuid, request: NewJob) -> Result<Job, AppError> {
    request.pickup.validate("pickup")?;
    request.dropoff.validate("dropoff")?;

    let mut seats_available = 0;
    let mut participants = Vec::new();

    let quote: FareQuote = match request.kind {
        JobKind::Package => fare::quote_package(&state.tariff, &request.pickup, &request.dropoff)?,
        JobKind::Ride | JobKind::SharedRide => {
            let (service, category) = rate_table(state, &request)?;

            if request.kind == JobKind::SharedRide {
                let seats = request.seats_booked.unwrap_or(1);
                validate_seats(seats, category.seat_capacity)?;
                seats_available = category.seat_capacity - seats;
                participants.push(Participant {
                    user_id: requester_id,
                    seats_booked: seats,
                    otp: None,
                    verified: false,
                });
            }

            fare::quote_ride(
                &service,
                &category,
                &request.pickup,
                &request.dropoff,
                state.tariff.average_speed_kmh,
            )?
        }
    };

    if quote.fare <= 0.0 {
        return Err(AppError::Validation(format!(
            "fare must be positive, got {}",
            quote.fare
        )));
    }

    let candidates =
        matcher::find_online_drivers_near(&state.store, &request.pickup, state.match_radius_meters);
    if candidates.is_empty() {
        warn!(requester_id = %requester_id, "no drivers near pickup; job not created");
        return Err(AppError::NoDriversNearby);
    }

    let now = Utc::now();
    let job = Job {
        id: Uuid::new_v4(),
        kind: request.kind,
        requester_id,
        driver_id: None,
        pickup: request.pickup,
        dropoff: request.dropoff,
        service_id: request.service_id,
        category_id: request.category_id,
        distance_km: quote.distance_km,
        duration_min: quote.duration_min,
        fare: quote.fare,
        state: JobState::Requested,
        otp: None,
        participants,
        seats_available,
        payment_method: request.payment_method,
        payment_status: PaymentStatus::Pending,
        rejected_driver_ids: BTreeSet::new(),
        created_at: now,
        updated_at: now,
        accepted_at: None,
        started_at: None,
        completed_at: None,
        cancelled_at: None,
    };

    state.store.insert_job(job.clone());
    state
        .metrics
        .jobs_created_total
        .with_label_values(&[job.kind.as_str()])
        .inc();

    info!(
        job_id = %job.id,
        kind = ?job.kind,
        fare = job.fare,
        candidates = candidates.len(),
        "job created"
    );

    let offers: Vec<Notification> = candidates
        .iter()
        .map(|driver| {
            Notification::new(driver.id, NotificationKind::JobOffered, job.id, "new job near you")
                .with_amount(job.fare)
        })
        .collect();
    state.notify_all(offers).await;

    Ok(job)
}

/// Drivers the job may still be offered to.
pub fn candidates(state: &AppState, job_id: Uuid) -> Result<Vec<Driver>, AppError> {
    let job = state.store.get_job(job_id)?;
    if job.state != JobState::Requested {
        return Ok(Vec::new());
    }
    Ok(matcher::candidates_for(
        &state.store,
        &job,
        state.match_radius_meters,
    ))
}

pub async fn accept(state: &AppState, job_id: Uuid, driver_id: Uuid) -> Result<Job, AppError> {
    let result = try_accept(state, job_id, driver_id);
    state.metrics.record_transition("accept", &result);
    let (job, deliveries) = result?;

    info!(job_id = %job_id, driver_id = %driver_id, "job accepted");

    let mut notifications = vec![Notification::new(
        job.requester_id,
        NotificationKind::JobAccepted,
        job.id,
        "a driver accepted your job",
    )];
    notifications.extend(
        job.participants
            .iter()
            .filter(|p| p.user_id != job.requester_id)
            .map(|p| {
                Notification::new(
                    p.user_id,
                    NotificationKind::JobAccepted,
                    job.id,
                    "a driver accepted your shared ride",
                )
            }),
    );
    notifications.extend(otp_notifications(job.id, NotificationKind::StartOtp, &deliveries));
    state.notify_all(notifications).await;

    Ok(job)
}

fn try_accept(
    state: &AppState,
    job_id: Uuid,
    driver_id: Uuid,
) -> Result<(Job, Vec<(Uuid, String)>), AppError> {
    let driver = state.store.get_driver(driver_id)?;
    if !driver.is_online {
        return Err(AppError::Validation(format!("driver {driver_id} is offline")));
    }

    let snapshot = state.store.get_job(job_id)?;
    if snapshot.rejected_driver_ids.contains(&driver_id) {
        return Err(AppError::Validation(format!(
            "driver {driver_id} already declined job {job_id}"
        )));
    }

    match snapshot.state {
        JobState::Requested => {}
        current if current.is_terminal() => return Err(AppError::invalid_state("accept")),
        _ if snapshot.driver_id != Some(driver_id) => {
            return Err(AppError::Conflict(format!(
                "job {job_id} already accepted by another driver"
            )));
        }
        _ => return Err(AppError::invalid_state("accept")),
    }
    ensure_transition(snapshot.state, JobState::Accepted, "accept")?;

    otp::issue(state, &snapshot, OtpPurpose::Start, |job| {
        advance(job, JobState::Accepted);
        job.driver_id = Some(driver_id);
    })
    .map_err(|err| match err {
        AppError::Conflict(_) => {
            warn!(job_id = %job_id, driver_id = %driver_id, "lost accept race");
            AppError::Conflict(format!("job {job_id} already accepted by another driver"))
        }
        other => other,
    })
}

pub async fn decline(state: &AppState, job_id: Uuid, driver_id: Uuid) -> Result<Job, AppError> {
    let result = try_decline(state, job_id, driver_id);
    state.metrics.record_transition("decline", &result);
    let job = result?;

    info!(job_id = %job_id, driver_id = %driver_id, "job declined");
    state
        .notify(Notification::new(
            job.requester_id,
            NotificationKind::JobDeclined,
            job.id,
            "a driver passed on your job, still looking",
        ))
        .await;

    Ok(job)
}

fn try_decline(state: &AppState, job_id: Uuid, driver_id: Uuid) -> Result<Job, AppError> {
    state.store.get_driver(driver_id)?;
    let snapshot = state.store.get_job(job_id)?;

    if snapshot.rejected_driver_ids.contains(&driver_id) {
        return Err(AppError::Validation(format!(
            "driver {driver_id} already declined job {job_id}"
        )));
    }
    if snapshot.state != JobState::Requested {
        return Err(AppError::invalid_state("decline"));
    }

    state
        .store
        .update_job_if(
            job_id,
            |job| job.state == JobState::Requested && !job.rejected_driver_ids.contains(&driver_id),
            |job| {
                job.rejected_driver_ids.insert(driver_id);
            },
        )
        .map_err(|err| conflict(err, format!("job {job_id} changed while declining, re-read and retry")))
}

pub async fn book_seats(state: &AppState, job_id: Uuid, user_id: Uuid, seats: u32) -> Result<Job, AppError> {
    let result = try_book_seats(state, job_id, user_id, seats);
    state.metrics.record_transition("book_seats", &result);
    let job = result?;

    info!(job_id = %job_id, user_id = %user_id, seats, "seats booked");

    let text = format!("{seats} seat(s) booked on your shared ride");
    let mut notifications = vec![Notification::new(
        job.requester_id,
        NotificationKind::SeatsBooked,
        job.id,
        text.clone(),
    )];
    if let Some(driver_id) = job.driver_id {
        notifications.push(Notification::new(driver_id, NotificationKind::SeatsBooked, job.id, text));
    }
    state.notify_all(notifications).await;

    Ok(job)
}

fn try_book_seats(state: &AppState, job_id: Uuid, user_id: Uuid, seats: u32) -> Result<Job, AppError> {
    let snapshot = state.store.get_job(job_id)?;

    if !snapshot.is_shared() {
        return Err(AppError::Validation(format!("job {job_id} is not a shared ride")));
    }
    if !matches!(snapshot.state, JobState::Requested | JobState::Accepted) {
        return Err(AppError::invalid_state("book seats"));
    }
    if snapshot.participant(user_id).is_some() {
        return Err(AppError::Validation(format!(
            "user {user_id} already has seats on job {job_id}"
        )));
    }
    validate_seats(seats, snapshot.seats_available)?;

    let expected_state = snapshot.state;
    let expected_available = snapshot.seats_available;
    state
        .store
        .update_job_if(
            job_id,
            |job| {
                job.state == expected_state
                    && job.seats_available == expected_available
                    && job.participant(user_id).is_none()
            },
            |job| {
                job.seats_available -= seats;
                job.participants.push(Participant {
                    user_id,
                    seats_booked: seats,
                    otp: None,
                    verified: false,
                });
            },
        )
        .map_err(|err| conflict(err, format!("seats on job {job_id} changed, re-read and retry")))
}

pub async fn start(state: &AppState, job_id: Uuid, driver_id: Uuid, code: &str) -> Result<Job, AppError> {
    let result = try_start(state, job_id, driver_id, code);
    state.metrics.record_transition("start", &result);
    let job = result?;

    info!(job_id = %job_id, driver_id = %driver_id, "trip started");

    let mut receivers = vec![job.requester_id];
    receivers.extend(
        job.participants
            .iter()
            .map(|p| p.user_id)
            .filter(|id| *id != job.requester_id),
    );
    state
        .notify_all(receivers.into_iter().map(|receiver| {
            Notification::new(receiver, NotificationKind::TripStarted, job.id, "your trip has started")
        }).collect())
        .await;

    Ok(job)
}

fn try_start(state: &AppState, job_id: Uuid, driver_id: Uuid, code: &str) -> Result<Job, AppError> {
    let snapshot = state.store.get_job(job_id)?;
    ensure_assigned(&snapshot, driver_id)?;
    otp::ensure_pending(&snapshot, OtpPurpose::Start, None)?;
    ensure_transition(snapshot.state, JobState::InProgress, "start")?;

    otp::verify_and_apply(
        state,
        &snapshot,
        GateCheck {
            purpose: OtpPurpose::Start,
            participant: None,
            submitted: code,
        },
        |job| advance(job, JobState::InProgress),
    )
}

/// Moves the trip into CLOSING and sends out close codes. Calling it again
/// while CLOSING replaces the outstanding codes.
pub async fn request_close(state: &AppState, job_id: Uuid, driver_id: Uuid) -> Result<Job, AppError> {
    let result = try_request_close(state, job_id, driver_id);
    state.metrics.record_transition("request_close", &result);
    let (job, deliveries) = result?;

    info!(job_id = %job_id, codes = deliveries.len(), "close requested");
    state
        .notify_all(otp_notifications(job.id, NotificationKind::CloseOtp, &deliveries))
        .await;

    Ok(job)
}

fn try_request_close(
    state: &AppState,
    job_id: Uuid,
    driver_id: Uuid,
) -> Result<(Job, Vec<(Uuid, String)>), AppError> {
    let snapshot = state.store.get_job(job_id)?;
    ensure_assigned(&snapshot, driver_id)?;

    match snapshot.state {
        JobState::InProgress => {
            ensure_transition(snapshot.state, JobState::Closing, "request close")?;
            otp::issue(state, &snapshot, OtpPurpose::Close, |job| {
                advance(job, JobState::Closing)
            })
        }
        JobState::Closing => otp::issue(state, &snapshot, OtpPurpose::Close, |_| {}),
        _ => Err(AppError::invalid_state("request close")),
    }
}

/// Verifies a close code. Shared rides need one verified code per
/// participant (`participant` names whose code this is); the job completes
/// when the last one is verified, and settlement runs right after.
pub async fn complete(
    state: &AppState,
    job_id: Uuid,
    driver_id: Uuid,
    code: &str,
    participant: Option<Uuid>,
) -> Result<Job, AppError> {
    let result = try_complete(state, job_id, driver_id, code, participant);
    state.metrics.record_transition("complete", &result);
    let job = result?;

    if job.state != JobState::Completed {
        info!(job_id = %job_id, participant = ?participant, "participant drop-off confirmed");
        if let Some(user_id) = participant {
            state
                .notify(Notification::new(
                    user_id,
                    NotificationKind::JobCompleted,
                    job.id,
                    "your drop-off is confirmed",
                ))
                .await;
        }
        return Ok(job);
    }

    info!(job_id = %job_id, fare = job.fare, "job completed");

    let mut receivers = vec![job.requester_id];
    receivers.extend(
        job.participants
            .iter()
            .map(|p| p.user_id)
            .filter(|id| *id != job.requester_id),
    );
    state
        .notify_all(receivers.into_iter().map(|receiver| {
            Notification::new(receiver, NotificationKind::JobCompleted, job.id, "your trip is complete")
                .with_amount(job.fare)
        }).collect())
        .await;

    if let Err(err) = settlement::settle(state, job.id).await {
        warn!(job_id = %job.id, error = %err, "settlement failed; job left pending payment");
    }

    Ok(state.store.get_job(job.id)?)
}

fn try_complete(
    state: &AppState,
    job_id: Uuid,
    driver_id: Uuid,
    code: &str,
    participant: Option<Uuid>,
) -> Result<Job, AppError> {
    let snapshot = state.store.get_job(job_id)?;
    ensure_assigned(&snapshot, driver_id)?;

    let participant = if snapshot.is_shared() {
        Some(participant.ok_or_else(|| {
            AppError::Validation("participant_id is required for shared rides".to_string())
        })?)
    } else {
        None
    };

    otp::ensure_pending(&snapshot, OtpPurpose::Close, participant)?;
    ensure_transition(snapshot.state, JobState::Completed, "complete")?;

    otp::verify_and_apply(
        state,
        &snapshot,
        GateCheck {
            purpose: OtpPurpose::Close,
            participant,
            submitted: code,
        },
        |job| {
            if job.all_participants_verified() {
                advance(job, JobState::Completed);
            }
        },
    )
}

pub async fn cancel(state: &AppState, job_id: Uuid, caller_id: Uuid) -> Result<Job, AppError> {
    let result = try_cancel(state, job_id, caller_id);
    state.metrics.record_transition("cancel", &result);
    let job = result?;

    info!(job_id = %job_id, cancelled_by = %caller_id, "job cancelled");

    let mut receivers: Vec<Uuid> = job
        .participants
        .iter()
        .map(|p| p.user_id)
        .chain(std::iter::once(job.requester_id))
        .chain(job.driver_id)
        .filter(|id| *id != caller_id)
        .collect();
    receivers.sort();
    receivers.dedup();

    state
        .notify_all(receivers.into_iter().map(|receiver| {
            Notification::new(receiver, NotificationKind::JobCancelled, job.id, "the job was cancelled")
        }).collect())
        .await;

    Ok(job)
}

fn try_cancel(state: &AppState, job_id: Uuid, caller_id: Uuid) -> Result<Job, AppError> {
    let snapshot = state.store.get_job(job_id)?;

    if snapshot.requester_id != caller_id && snapshot.driver_id != Some(caller_id) {
        return Err(AppError::Forbidden(format!(
            "only the requester or assigned driver may cancel job {job_id}"
        )));
    }
    ensure_transition(snapshot.state, JobState::Cancelled, "cancel")?;

    let expected_state = snapshot.state;
    state
        .store
        .update_job_if(
            job_id,
            |job| job.state == expected_state,
            |job| {
                advance(job, JobState::Cancelled);
                job.otp = None;
                for participant in &mut job.participants {
                    participant.otp = None;
                }
            },
        )
        .map_err(|err| conflict(err, format!("job {job_id} changed while cancelling, re-read and retry")))
}

/// Replaces the outstanding code(s) for whichever gate the job is waiting on.
pub async fn reissue_otp(state: &AppState, job_id: Uuid, driver_id: Uuid) -> Result<Job, AppError> {
    let result = try_reissue_otp(state, job_id, driver_id);
    state.metrics.record_transition("reissue_otp", &result);
    let (job, kind, deliveries) = result?;

    state
        .notify_all(otp_notifications(job.id, kind, &deliveries))
        .await;
    Ok(job)
}

fn try_reissue_otp(
    state: &AppState,
    job_id: Uuid,
    driver_id: Uuid,
) -> Result<(Job, NotificationKind, Vec<(Uuid, String)>), AppError> {
    let snapshot = state.store.get_job(job_id)?;
    ensure_assigned(&snapshot, driver_id)?;

    let (purpose, kind) = match snapshot.state {
        JobState::Accepted => (OtpPurpose::Start, NotificationKind::StartOtp),
        JobState::Closing => (OtpPurpose::Close, NotificationKind::CloseOtp),
        _ => return Err(AppError::invalid_state("reissue otp")),
    };

    let (job, deliveries) = otp::issue(state, &snapshot, purpose, |_| {})?;
    Ok((job, kind, deliveries))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::error::OtpRejection;
    use crate::test_helpers::{
        failing_notifier_state, package_request, ride_request, seed_driver, seed_rates, test_state,
        RecordingDispatch,
    };

    fn other_code(code: &str) -> String {
        if code == "0000" { "1111".to_string() } else { "0000".to_string() }
    }

    async fn accepted_package(state: &AppState, events: &RecordingDispatch) -> (Job, Driver, String) {
        let driver = seed_driver(state, 0.001);
        let job = create_job(state, Uuid::new_v4(), package_request()).await.unwrap();
        let job = accept(state, job.id, driver.id).await.unwrap();
        let code = events
            .otp_for(job.requester_id, NotificationKind::StartOtp)
            .expect("start otp delivered to requester");
        (job, driver, code)
    }

    async fn closing_package(state: &AppState, events: &RecordingDispatch) -> (Job, Driver, String) {
        let (job, driver, start_code) = accepted_package(state, events).await;
        start(state, job.id, driver.id, &start_code).await.unwrap();
        let job = request_close(state, job.id, driver.id).await.unwrap();
        let code = events
            .otp_for(job.requester_id, NotificationKind::CloseOtp)
            .expect("close otp delivered to requester");
        (job, driver, code)
    }

    #[tokio::test]
    async fn creation_prices_package_and_offers_only_nearby_drivers() {
        let (state, events) = test_state();
        let near = seed_driver(&state, 0.001);
        seed_driver(&state, 1.0);

        let job = create_job(&state, Uuid::new_v4(), package_request()).await.unwrap();

        assert_eq!(job.state, JobState::Requested);
        assert_eq!(job.fare, (50.0 + job.distance_km * 20.0).round());
        assert!(job.duration_min > 0.0);

        let offers = events.of_kind(NotificationKind::JobOffered);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].receiver_id, near.id);
    }

    #[tokio::test]
    async fn no_drivers_nearby_stores_nothing() {
        let (state, _events) = test_state();
        seed_driver(&state, 2.0);

        let err = create_job(&state, Uuid::new_v4(), package_request()).await.unwrap_err();

        assert!(matches!(err, AppError::NoDriversNearby));
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(state.store.job_count(), 0);
    }

    #[tokio::test]
    async fn invalid_coordinates_are_rejected_before_matching() {
        let (state, _events) = test_state();
        seed_driver(&state, 0.001);

        let mut request = package_request();
        request.dropoff = GeoPoint::new(f64::NAN, 72.0);

        let err = create_job(&state, Uuid::new_v4(), request).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(state.store.job_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_accepts_have_exactly_one_winner() {
        let (state, _events) = test_state();
        let state = Arc::new(state);
        let first = seed_driver(&state, 0.001);
        let second = seed_driver(&state, 0.002);
        let job = create_job(&state, Uuid::new_v4(), package_request()).await.unwrap();
        let job_id = job.id;

        let handles: Vec<_> = [first.id, second.id]
            .into_iter()
            .map(|driver_id| {
                let state = state.clone();
                tokio::spawn(async move { (driver_id, accept(&state, job_id, driver_id).await) })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            let (driver_id, result) = handle.await.unwrap();
            match result {
                Ok(job) => {
                    assert_eq!(job.state, JobState::Accepted);
                    assert_eq!(job.driver_id, Some(driver_id));
                    winners.push(driver_id);
                }
                Err(err) => assert!(matches!(err, AppError::Conflict(_)), "got {err:?}"),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(state.store.get_job(job_id).unwrap().driver_id, Some(winners[0]));
    }

    #[tokio::test]
    async fn start_needs_the_assigned_driver_and_the_right_code() {
        let (state, events) = test_state();
        let (job, driver, code) = accepted_package(&state, &events).await;
        let stranger = seed_driver(&state, 0.003);

        let err = start(&state, job.id, stranger.id, &code).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = start(&state, job.id, driver.id, &other_code(&code)).await.unwrap_err();
        assert!(matches!(err, AppError::Otp(OtpRejection::Mismatch)));
        assert_eq!(state.store.get_job(job.id).unwrap().state, JobState::Accepted);

        let started = start(&state, job.id, driver.id, &code).await.unwrap();
        assert_eq!(started.state, JobState::InProgress);
        assert!(started.otp.is_none());
        assert!(started.started_at.is_some());
    }

    #[tokio::test]
    async fn close_code_works_once_and_settles_the_job() {
        let (state, events) = test_state();
        let (job, driver, code) = closing_package(&state, &events).await;
        let fare_at_creation = job.fare;
        assert_eq!(job.state, JobState::Closing);

        let err = complete(&state, job.id, driver.id, &other_code(&code), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Otp(OtpRejection::Mismatch)));
        assert_eq!(state.store.get_job(job.id).unwrap().state, JobState::Closing);

        let done = complete(&state, job.id, driver.id, &code, None).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert!(done.otp.is_none());
        assert_eq!(done.fare, fare_at_creation);
        assert_eq!(done.payment_status, PaymentStatus::Paid);

        let err = complete(&state, job.id, driver.id, &code, None).await.unwrap_err();
        assert!(matches!(err, AppError::Otp(OtpRejection::NotIssued)));

        let payment = state.store.payment_for_job(job.id).unwrap();
        assert_eq!(payment.amount, fare_at_creation);
        assert_eq!(state.store.payment_count(), 1);
        assert_eq!(state.store.get_driver(driver.id).unwrap().completed_jobs, 1);
    }

    #[tokio::test]
    async fn terminal_jobs_reject_every_transition() {
        let (state, _events) = test_state();
        let driver = seed_driver(&state, 0.001);
        let requester = Uuid::new_v4();
        let job = create_job(&state, requester, package_request()).await.unwrap();

        let cancelled = cancel(&state, job.id, requester).await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);

        for err in [
            accept(&state, job.id, driver.id).await.unwrap_err(),
            cancel(&state, job.id, requester).await.unwrap_err(),
            decline(&state, job.id, driver.id).await.unwrap_err(),
        ] {
            assert!(matches!(err, AppError::Validation(_)), "got {err:?}");
        }

        let stored = state.store.get_job(job.id).unwrap();
        assert_eq!(stored.state, JobState::Cancelled);
        assert_eq!(stored.driver_id, None);
        assert_eq!(stored.updated_at, cancelled.updated_at);
    }

    #[tokio::test]
    async fn completed_jobs_are_final() {
        let (state, events) = test_state();
        let (job, driver, code) = closing_package(&state, &events).await;
        let done = complete(&state, job.id, driver.id, &code, None).await.unwrap();
        assert_eq!(done.state, JobState::Completed);

        for err in [
            accept(&state, job.id, driver.id).await.unwrap_err(),
            cancel(&state, job.id, job.requester_id).await.unwrap_err(),
            decline(&state, job.id, driver.id).await.unwrap_err(),
            reissue_otp(&state, job.id, driver.id).await.unwrap_err(),
            request_close(&state, job.id, driver.id).await.unwrap_err(),
        ] {
            assert!(matches!(err, AppError::Validation(_)), "got {err:?}");
        }

        let stored = state.store.get_job(job.id).unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.driver_id, Some(driver.id));
        assert!(stored.otp.is_none());
        assert!(stored.rejected_driver_ids.is_empty());
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(stored.updated_at, done.updated_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn duplicate_close_submissions_complete_and_settle_once() {
        let (state, events) = test_state();
        let state = Arc::new(state);
        let (job, driver, code) = closing_package(&state, &events).await;
        let job_id = job.id;
        let driver_id = driver.id;

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let state = state.clone();
                let code = code.clone();
                tokio::spawn(async move { complete(&state, job_id, driver_id, &code, None).await })
            })
            .collect();

        let mut completed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(job) => {
                    assert_eq!(job.state, JobState::Completed);
                    completed += 1;
                }
                Err(err) => assert!(
                    matches!(err, AppError::Conflict(_) | AppError::Otp(OtpRejection::NotIssued)),
                    "got {err:?}"
                ),
            }
        }

        assert_eq!(completed, 1);
        assert_eq!(state.store.payment_count(), 1);
        assert_eq!(state.store.get_driver(driver.id).unwrap().completed_jobs, 1);
    }

    #[tokio::test]
    async fn verification_against_a_stale_snapshot_conflicts() {
        let (state, events) = test_state();
        let (job, driver, code) = accepted_package(&state, &events).await;
        let stale = state.store.get_job(job.id).unwrap();

        start(&state, job.id, driver.id, &code).await.unwrap();

        let err = otp::verify_and_apply(
            &state,
            &stale,
            GateCheck {
                purpose: OtpPurpose::Start,
                participant: None,
                submitted: &code,
            },
            |job| advance(job, JobState::InProgress),
        )
        .unwrap_err();

        assert!(matches!(err, AppError::Conflict(_)), "got {err:?}");
        let stored = state.store.get_job(job.id).unwrap();
        assert_eq!(stored.state, JobState::InProgress);
        assert!(stored.otp.is_none());
    }

    #[tokio::test]
    async fn only_parties_may_cancel() {
        let (state, _events) = test_state();
        seed_driver(&state, 0.001);
        let job = create_job(&state, Uuid::new_v4(), package_request()).await.unwrap();

        let err = cancel(&state, job.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn in_progress_jobs_cannot_be_cancelled() {
        let (state, events) = test_state();
        let (job, driver, code) = accepted_package(&state, &events).await;
        start(&state, job.id, driver.id, &code).await.unwrap();

        let err = cancel(&state, job.id, job.requester_id).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn declining_twice_is_rejected_and_excludes_the_driver() {
        let (state, _events) = test_state();
        let picky = seed_driver(&state, 0.001);
        let other = seed_driver(&state, 0.002);
        let job = create_job(&state, Uuid::new_v4(), package_request()).await.unwrap();

        decline(&state, job.id, picky.id).await.unwrap();
        let err = decline(&state, job.id, picky.id).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let offered: Vec<Uuid> = candidates(&state, job.id).unwrap().iter().map(|d| d.id).collect();
        assert_eq!(offered, vec![other.id]);

        let err = accept(&state, job.id, picky.id).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(state.store.get_job(job.id).unwrap().state, JobState::Requested);
    }

    #[tokio::test]
    async fn seats_beyond_availability_book_nothing() {
        let (state, _events) = test_state();
        seed_driver(&state, 0.001);
        let (service, category) = seed_rates(&state, 4);

        let err = create_job(
            &state,
            Uuid::new_v4(),
            ride_request(JobKind::SharedRide, &service, &category, Some(6)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(state.store.job_count(), 0);

        let job = create_job(
            &state,
            Uuid::new_v4(),
            ride_request(JobKind::SharedRide, &service, &category, Some(1)),
        )
        .await
        .unwrap();
        assert_eq!(job.seats_available, 3);

        let err = book_seats(&state, job.id, Uuid::new_v4(), 6).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let err = book_seats(&state, job.id, Uuid::new_v4(), 0).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let stored = state.store.get_job(job.id).unwrap();
        assert_eq!(stored.seats_available, 3);
        assert_eq!(stored.participants.len(), 1);

        let booked = book_seats(&state, job.id, Uuid::new_v4(), 3).await.unwrap();
        assert_eq!(booked.seats_available, 0);
        assert_eq!(booked.participants.len(), 2);
    }

    #[tokio::test]
    async fn shared_ride_completes_after_every_participant_verifies() {
        let (state, events) = test_state();
        let driver = seed_driver(&state, 0.001);
        let (service, category) = seed_rates(&state, 4);
        let requester = Uuid::new_v4();
        let co_rider = Uuid::new_v4();

        let job = create_job(
            &state,
            requester,
            ride_request(JobKind::SharedRide, &service, &category, Some(1)),
        )
        .await
        .unwrap();
        book_seats(&state, job.id, co_rider, 2).await.unwrap();
        accept(&state, job.id, driver.id).await.unwrap();

        let start_code = events.otp_for(requester, NotificationKind::StartOtp).unwrap();
        start(&state, job.id, driver.id, &start_code).await.unwrap();
        request_close(&state, job.id, driver.id).await.unwrap();

        let requester_code = events.otp_for(requester, NotificationKind::CloseOtp).unwrap();
        let co_rider_code = events.otp_for(co_rider, NotificationKind::CloseOtp).unwrap();

        let err = complete(&state, job.id, driver.id, &requester_code, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let partial = complete(&state, job.id, driver.id, &requester_code, Some(requester))
            .await
            .unwrap();
        assert_eq!(partial.state, JobState::Closing);
        assert!(partial.participant(requester).unwrap().verified);
        assert!(!partial.participant(co_rider).unwrap().verified);
        assert!(state.store.payment_for_job(job.id).is_none());

        let done = complete(&state, job.id, driver.id, &co_rider_code, Some(co_rider))
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert!(done.all_participants_verified());
        assert_eq!(done.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn expired_code_is_cleared_and_can_be_reissued() {
        let (state, events) = test_state();
        let (job, driver, code) = accepted_package(&state, &events).await;

        state
            .store
            .update_job_if(
                job.id,
                |_| true,
                |job| {
                    if let Some(otp) = job.otp.as_mut() {
                        otp.issued_at = Utc::now() - Duration::hours(2);
                    }
                },
            )
            .unwrap();

        let err = start(&state, job.id, driver.id, &code).await.unwrap_err();
        assert!(matches!(err, AppError::Otp(OtpRejection::Expired)));
        assert!(state.store.get_job(job.id).unwrap().otp.is_none());

        let err = start(&state, job.id, driver.id, &code).await.unwrap_err();
        assert!(matches!(err, AppError::Otp(OtpRejection::NotIssued)));

        reissue_otp(&state, job.id, driver.id).await.unwrap();
        let fresh = events.otp_for(job.requester_id, NotificationKind::StartOtp).unwrap();
        let started = start(&state, job.id, driver.id, &fresh).await.unwrap();
        assert_eq!(started.state, JobState::InProgress);
    }

    #[tokio::test]
    async fn notification_failures_do_not_fail_transitions() {
        let state = failing_notifier_state();
        seed_driver(&state, 0.001);

        let job = create_job(&state, Uuid::new_v4(), package_request()).await.unwrap();

        assert_eq!(state.store.get_job(job.id).unwrap().state, JobState::Requested);
        assert!(state.metrics.notifications_failed_total.get() >= 1);
    }
}
