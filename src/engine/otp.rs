use chrono::Utc;
use rand::Rng;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::OtpConfig;
use crate::error::{AppError, OtpRejection};
use crate::models::job::{Job, OtpCode, OtpPurpose};
use crate::state::AppState;
use crate::store::StoreError;

#[derive(Debug, Clone)]
pub struct OtpGate {
    length: usize,
    ttl: Option<chrono::Duration>,
}

impl OtpGate {
    pub fn new(config: &OtpConfig) -> Self {
        Self {
            length: config.length,
            ttl: config.ttl,
        }
    }

    pub fn generate(&self, purpose: OtpPurpose) -> OtpCode {
        let mut rng = rand::thread_rng();
        let code: String = (0..self.length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();

        OtpCode {
            code,
            purpose,
            issued_at: Utc::now(),
        }
    }

    /// Checks a submission against the stored code without touching the store.
    pub fn check(
        &self,
        stored: Option<&OtpCode>,
        purpose: OtpPurpose,
        submitted: &str,
    ) -> Result<(), OtpRejection> {
        let stored = match stored {
            Some(code) if code.purpose == purpose => code,
            _ => return Err(OtpRejection::NotIssued),
        };

        if stored.is_expired(Utc::now(), self.ttl) {
            return Err(OtpRejection::Expired);
        }

        if stored.code != submitted.trim() {
            return Err(OtpRejection::Mismatch);
        }

        Ok(())
    }
}

/// Which slot a submission is checked against.
#[derive(Debug, Clone, Copy)]
pub struct GateCheck<'a> {
    pub purpose: OtpPurpose,
    pub participant: Option<Uuid>,
    pub submitted: &'a str,
}

fn slot(job: &Job, participant: Option<Uuid>) -> Option<&OtpCode> {
    match participant {
        Some(user_id) => job.participant(user_id).and_then(|p| p.otp.as_ref()),
        None => job.otp.as_ref(),
    }
}

fn clear_slot(job: &mut Job, participant: Option<Uuid>) {
    match participant {
        Some(user_id) => {
            if let Some(p) = job.participant_mut(user_id) {
                p.otp = None;
                p.verified = true;
            }
        }
        None => job.otp = None,
    }
}

/// Fails with `NotIssued` unless a code for `purpose` is waiting in the slot.
pub fn ensure_pending(
    snapshot: &Job,
    purpose: OtpPurpose,
    participant: Option<Uuid>,
) -> Result<(), AppError> {
    if let Some(user_id) = participant {
        if snapshot.participant(user_id).is_none() {
            return Err(AppError::NotFound(format!(
                "user {user_id} is not a participant of job {}",
                snapshot.id
            )));
        }
    }

    match slot(snapshot, participant) {
        Some(code) if code.purpose == purpose => Ok(()),
        _ => Err(AppError::Otp(OtpRejection::NotIssued)),
    }
}

/// Verifies `check.submitted` and, in the same conditional update, clears the
/// code and runs `transition`. The update only applies if the job is still in
/// the snapshot's state and the slot still holds the code that was checked.
pub fn verify_and_apply<F>(
    state: &AppState,
    snapshot: &Job,
    check: GateCheck<'_>,
    transition: F,
) -> Result<Job, AppError>
where
    F: FnOnce(&mut Job),
{
    ensure_pending(snapshot, check.purpose, check.participant)?;
    let stored = slot(snapshot, check.participant).cloned();

    match state.otp.check(stored.as_ref(), check.purpose, check.submitted) {
        Ok(()) => {}
        Err(OtpRejection::Expired) => {
            expire(state, snapshot, check, stored.as_ref());
            return Err(AppError::Otp(OtpRejection::Expired));
        }
        Err(rejection) => {
            debug!(job_id = %snapshot.id, ?rejection, "otp rejected");
            return Err(AppError::Otp(rejection));
        }
    }

    let expected_state = snapshot.state;
    let participant = check.participant;
    let updated = state
        .store
        .update_job_if(
            snapshot.id,
            |job| job.state == expected_state && slot(job, participant) == stored.as_ref(),
            |job| {
                clear_slot(job, participant);
                transition(job);
            },
        )
        .map_err(|err| match err {
            StoreError::Conflict(_) => AppError::Conflict(format!(
                "otp or state of job {} changed concurrently, re-read and retry",
                snapshot.id
            )),
            other => other.into(),
        })?;

    info!(job_id = %snapshot.id, purpose = ?check.purpose, "otp verified");
    Ok(updated)
}

/// Clears an expired code so a fresh one has to be issued. Losing the race
/// here is harmless: whoever won already replaced or consumed the code.
fn expire(state: &AppState, snapshot: &Job, check: GateCheck<'_>, stored: Option<&OtpCode>) {
    let participant = check.participant;
    let result = state.store.update_job_if(
        snapshot.id,
        |job| job.state == snapshot.state && slot(job, participant) == stored,
        |job| match participant {
            Some(user_id) => {
                if let Some(p) = job.participant_mut(user_id) {
                    p.otp = None;
                }
            }
            None => job.otp = None,
        },
    );

    if let Err(err) = result {
        debug!(job_id = %snapshot.id, error = %err, "expired otp already replaced");
    }
}

/// Fresh codes for every slot the job's pending gate needs: the job-level
/// slot, or one per unverified participant when closing a shared ride.
/// Returns the updated job and the `(receiver, code)` pairs to deliver.
pub fn issue(
    state: &AppState,
    snapshot: &Job,
    purpose: OtpPurpose,
    transition: impl FnOnce(&mut Job),
) -> Result<(Job, Vec<(Uuid, String)>), AppError> {
    let per_participant = purpose == OtpPurpose::Close && snapshot.is_shared();

    let mut deliveries = Vec::new();
    let job_code = if per_participant {
        None
    } else {
        let code = state.otp.generate(purpose);
        deliveries.push((snapshot.requester_id, code.code.clone()));
        Some(code)
    };

    let participant_codes: Vec<(Uuid, OtpCode)> = if per_participant {
        snapshot
            .participants
            .iter()
            .filter(|p| !p.verified)
            .map(|p| (p.user_id, state.otp.generate(purpose)))
            .collect()
    } else {
        Vec::new()
    };
    deliveries.extend(
        participant_codes
            .iter()
            .map(|(user_id, code)| (*user_id, code.code.clone())),
    );

    let expected_state = snapshot.state;
    let expected_otp = snapshot.otp.clone();
    let expected_participants = snapshot.participants.clone();

    let updated = state
        .store
        .update_job_if(
            snapshot.id,
            |job| {
                job.state == expected_state
                    && job.otp == expected_otp
                    && job.participants == expected_participants
            },
            |job| {
                transition(job);
                job.otp = job_code;
                for (user_id, code) in participant_codes {
                    if let Some(p) = job.participant_mut(user_id) {
                        p.otp = Some(code);
                    }
                }
            },
        )
        .map_err(|err| match err {
            StoreError::Conflict(_) => AppError::Conflict(format!(
                "job {} changed while issuing otp, re-read and retry",
                snapshot.id
            )),
            other => other.into(),
        })?;

    info!(job_id = %snapshot.id, purpose = ?purpose, codes = deliveries.len(), "otp issued");
    Ok((updated, deliveries))
}
