use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::fare;
use crate::error::AppError;
use crate::models::job::{Job, JobState};
use crate::models::notification::{Notification, NotificationKind};
use crate::models::payment::{Payment, PaymentMethod, PaymentStatus};
use crate::payment::SessionRequest;
use crate::state::AppState;
use crate::store::StoreError;

pub async fn settle(state: &AppState, job_id: Uuid) -> Result<Payment, AppError> {
    let start = Instant::now();
    let job = state.store.get_job(job_id)?;
    let method = job.payment_method;

    let result = run_settlement(state, &job).await;

    let outcome = if result.is_ok() { "success" } else { "error" };
    state
        .metrics
        .settlement_latency_seconds
        .with_label_values(&[outcome])
        .observe(start.elapsed().as_secs_f64());
    state
        .metrics
        .settlements_total
        .with_label_values(&[method.as_str(), outcome])
        .inc();

    let payment = result?;

    state
        .notify_all(vec![
            Notification::new(
                payment.driver_id,
                NotificationKind::PaymentSettled,
                job_id,
                "earnings credited for your trip",
            )
            .with_amount(payment.driver_share),
            Notification::new(
                payment.payer_id,
                NotificationKind::PaymentSettled,
                job_id,
                "payment received, thank you for riding",
            )
            .with_amount(payment.amount),
        ])
        .await;

    Ok(payment)
}

fn check_preconditions(state: &AppState, job: &Job) -> Result<Uuid, AppError> {
    if job.state != JobState::Completed {
        return Err(AppError::invalid_state("settle"));
    }
    if !job.fare.is_finite() || job.fare <= 0.0 {
        return Err(AppError::Validation(format!(
            "job {} has no positive fare to settle",
            job.id
        )));
    }
    let driver_id = job
        .driver_id
        .ok_or_else(|| AppError::Validation(format!("job {} has no driver", job.id)))?;

    if let Some(existing) = state.store.payment_for_job(job.id) {
        if existing.status == PaymentStatus::Paid {
            return Err(AppError::Conflict(format!("job {} already settled", job.id)));
        }
    }

    Ok(driver_id)
}

/// Moves the job from PENDING to PROCESSING. Only the caller that wins this
/// update may open a payment session or write the payment record.
fn claim(state: &AppState, job: &Job) -> Result<(), AppError> {
    state
        .store
        .update_job_if(
            job.id,
            |stored| stored.state == JobState::Completed && stored.payment_status == PaymentStatus::Pending,
            |stored| stored.payment_status = PaymentStatus::Processing,
        )
        .map(|_| ())
        .map_err(|err| match err {
            StoreError::Conflict(_) => {
                warn!(job_id = %job.id, "settlement already claimed");
                match state.store.get_job(job.id) {
                    Ok(current) if current.payment_status == PaymentStatus::Paid => {
                        AppError::Conflict(format!("job {} already settled", job.id))
                    }
                    _ => AppError::Conflict(format!("job {} is already being settled", job.id)),
                }
            }
            other => other.into(),
        })
}

fn release(state: &AppState, job_id: Uuid) {
    if let Err(err) = state.store.update_job_if(
        job_id,
        |stored| stored.payment_status == PaymentStatus::Processing,
        |stored| stored.payment_status = PaymentStatus::Pending,
    ) {
        error!(job_id = %job_id, error = %err, "failed to release settlement claim");
    }
}

async fn run_settlement(state: &AppState, job: &Job) -> Result<Payment, AppError> {
    let driver_id = check_preconditions(state, job)?;
    claim(state, job)?;

    match record_payment(state, job, driver_id).await {
        Ok(payment) => {
            post_ledgers(state, job, &payment);
            Ok(payment)
        }
        Err(err) => {
            release(state, job.id);
            Err(err)
        }
    }
}

async fn record_payment(state: &AppState, job: &Job, driver_id: Uuid) -> Result<Payment, AppError> {
    let (driver_share, platform_share) = fare::split(job.fare);

    let (external_transaction_ref, redirect_url) = match job.payment_method {
        PaymentMethod::Card => {
            let session = open_card_session(state, job).await?;
            (session.session_id, Some(session.redirect_url))
        }
        PaymentMethod::Offline => (format!("offline-{}", Uuid::new_v4().simple()), None),
    };

    let payment = state
        .store
        .insert_payment_if_absent(Payment {
            id: Uuid::new_v4(),
            job_id: job.id,
            payer_id: job.requester_id,
            driver_id,
            method: job.payment_method,
            status: PaymentStatus::Paid,
            amount: job.fare,
            driver_share,
            platform_share,
            external_transaction_ref,
            redirect_url,
            paid_at: Some(Utc::now()),
        })
        .map_err(|err| {
            warn!(job_id = %job.id, error = %err, "lost settlement race");
            AppError::from(err)
        })?;

    info!(
        job_id = %job.id,
        driver_id = %driver_id,
        method = payment.method.as_str(),
        driver_share,
        platform_share,
        "job settled"
    );

    Ok(payment)
}

async fn open_card_session(
    state: &AppState,
    job: &Job,
) -> Result<crate::payment::PaymentSessionHandle, AppError> {
    let request = SessionRequest {
        amount: (job.fare * 100.0).round() as u64,
        currency: state.payment_currency.clone(),
        description: format!("{} {}", job.kind.as_str(), job.id),
        metadata: json!({
            "job_id": job.id,
            "requester_id": job.requester_id,
            "driver_id": job.driver_id,
        }),
    };

    match tokio::time::timeout(state.payment_timeout, state.payments.create_session(request)).await {
        Ok(Ok(session)) => Ok(session),
        Ok(Err(err)) => {
            error!(job_id = %job.id, error = %err, "payment session creation failed");
            Err(AppError::Internal(format!("payment session failed: {err}")))
        }
        Err(_) => {
            error!(job_id = %job.id, "payment session creation timed out");
            Err(AppError::Internal("payment session timed out".to_string()))
        }
    }
}

/// Independent increments that follow a committed payment record. A failure
/// in one is logged and does not stop the others.
fn post_ledgers(state: &AppState, job: &Job, payment: &Payment) {
    let today = Utc::now().date_naive();

    if let Err(err) = state.store.update_job_if(
        job.id,
        |stored| stored.payment_status == PaymentStatus::Processing,
        |stored| stored.payment_status = PaymentStatus::Paid,
    ) {
        error!(job_id = %job.id, error = %err, "failed to mark job paid");
    }

    if let Err(err) = state.store.credit_driver(payment.driver_id, payment.driver_share) {
        error!(driver_id = %payment.driver_id, error = %err, "failed to credit driver");
    }

    state.store.add_platform_revenue(today, payment.platform_share);
    state.store.record_trip(payment.payer_id, payment.amount);

    let entry = state.store.upsert_ledger(payment.driver_id, today, |entry| {
        entry.credit(payment.method, payment.driver_share)
    });

    info!(
        driver_id = %payment.driver_id,
        date = %today,
        total_earning = entry.total_earning,
        available_earning = entry.available_earning(),
        "ledger updated"
    );
}
