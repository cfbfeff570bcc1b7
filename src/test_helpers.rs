use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::lifecycle::NewJob;
use crate::models::driver::{Driver, GeoPoint};
use crate::models::job::{Job, JobKind, JobState};
use crate::models::notification::{Notification, NotificationKind};
use crate::models::payment::{PaymentMethod, PaymentStatus};
use crate::models::rates::{Category, Service};
use crate::notify::{DispatchError, NotificationDispatch};
use crate::payment::{PaymentError, PaymentSession, PaymentSessionHandle, SessionRequest, Unconfigured};
use crate::state::AppState;

/// Pickup used by every fixture job; seeded drivers park a few metres away.
pub const PICKUP: (f64, f64) = (19.0760, 72.8777);

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.payment.timeout = Duration::from_millis(100);
    config
}

/// Keeps every published notification so tests can read OTPs back out.
#[derive(Default)]
pub struct RecordingDispatch {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingDispatch {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.sent().into_iter().filter(|n| n.kind == kind).collect()
    }

    /// Most recent code delivered to `receiver` with `kind`.
    pub fn otp_for(&self, receiver: Uuid, kind: NotificationKind) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|n| n.receiver_id == receiver && n.kind == kind)
            .and_then(|n| n.otp)
    }
}

#[async_trait]
impl NotificationDispatch for RecordingDispatch {
    async fn publish(&self, notification: Notification) -> Result<(), DispatchError> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

pub struct FailingDispatch;

#[async_trait]
impl NotificationDispatch for FailingDispatch {
    async fn publish(&self, _notification: Notification) -> Result<(), DispatchError> {
        Err(DispatchError::Delivery("push gateway unavailable".to_string()))
    }
}

enum SessionBehaviour {
    Succeed,
    Slow(Duration),
    Fail,
    Hang,
}

pub struct FakePaymentSession {
    behaviour: SessionBehaviour,
    calls: AtomicUsize,
    amounts: Mutex<Vec<u64>>,
}

impl FakePaymentSession {
    fn with(behaviour: SessionBehaviour) -> Self {
        Self {
            behaviour,
            calls: AtomicUsize::new(0),
            amounts: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::with(SessionBehaviour::Succeed)
    }

    /// Succeeds after `delay`, long enough for concurrent callers to overlap.
    pub fn slow(delay: Duration) -> Self {
        Self::with(SessionBehaviour::Slow(delay))
    }

    pub fn failing() -> Self {
        Self::with(SessionBehaviour::Fail)
    }

    pub fn hanging() -> Self {
        Self::with(SessionBehaviour::Hang)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn amounts(&self) -> Vec<u64> {
        self.amounts.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentSession for FakePaymentSession {
    async fn create_session(
        &self,
        request: SessionRequest,
    ) -> Result<PaymentSessionHandle, PaymentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.amounts.lock().unwrap().push(request.amount);

        let handle = PaymentSessionHandle {
            session_id: format!("cs_test_{call}"),
            redirect_url: format!("https://pay.test/cs_test_{call}"),
        };

        match self.behaviour {
            SessionBehaviour::Succeed => Ok(handle),
            SessionBehaviour::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(handle)
            }
            SessionBehaviour::Fail => Err(PaymentError::Rejected {
                status: 402,
                body: "card declined".to_string(),
            }),
            SessionBehaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(PaymentError::Transport("unreachable".to_string()))
            }
        }
    }
}

pub fn test_state() -> (AppState, Arc<RecordingDispatch>) {
    let events = Arc::new(RecordingDispatch::default());
    let state = AppState::with_collaborators(&test_config(), events.clone(), Arc::new(Unconfigured));
    (state, events)
}

pub fn test_state_with_payments(
    payments: Arc<dyn PaymentSession>,
) -> (AppState, Arc<RecordingDispatch>) {
    let events = Arc::new(RecordingDispatch::default());
    let state = AppState::with_collaborators(&test_config(), events.clone(), payments);
    (state, events)
}

pub fn failing_notifier_state() -> AppState {
    AppState::with_collaborators(&test_config(), Arc::new(FailingDispatch), Arc::new(Unconfigured))
}

/// Registers an online driver `offset` degrees north of the fixture pickup.
pub fn seed_driver(state: &AppState, offset: f64) -> Driver {
    let driver = Driver {
        id: Uuid::new_v4(),
        name: "Test Driver".to_string(),
        location: GeoPoint::new(PICKUP.0 + offset, PICKUP.1),
        is_online: true,
        total_earning: 0.0,
        completed_jobs: 0,
        updated_at: Utc::now(),
    };
    state.store.insert_driver(driver.clone()).unwrap();
    driver
}

pub fn seed_rates(state: &AppState, seat_capacity: u32) -> (Service, Category) {
    let service = Service {
        id: Uuid::new_v4(),
        name: "City".to_string(),
        base_fare: 30.0,
    };
    let category = Category {
        id: Uuid::new_v4(),
        service_id: service.id,
        name: "Sedan".to_string(),
        base_price: 10.0,
        rate_per_km: 12.0,
        rate_per_hour: 60.0,
        seat_capacity,
    };
    state.store.insert_service(service.clone());
    state.store.insert_category(category.clone());
    (service, category)
}

pub fn package_request() -> NewJob {
    NewJob {
        kind: JobKind::Package,
        pickup: GeoPoint::new(PICKUP.0, PICKUP.1),
        dropoff: GeoPoint::new(PICKUP.0, PICKUP.1 + 0.01),
        service_id: None,
        category_id: None,
        payment_method: PaymentMethod::Offline,
        seats_booked: None,
    }
}

pub fn ride_request(kind: JobKind, service: &Service, category: &Category, seats: Option<u32>) -> NewJob {
    NewJob {
        kind,
        service_id: Some(service.id),
        category_id: Some(category.id),
        seats_booked: seats,
        ..package_request()
    }
}

/// Inserts a job that already reached COMPLETED with `fare`, assigned to a
/// freshly seeded driver.
pub fn completed_job(state: &AppState, fare: f64, method: PaymentMethod) -> Job {
    let driver = seed_driver(state, 0.001);
    let now = Utc::now();
    let job = Job {
        id: Uuid::new_v4(),
        kind: JobKind::Ride,
        requester_id: Uuid::new_v4(),
        driver_id: Some(driver.id),
        pickup: GeoPoint::new(PICKUP.0, PICKUP.1),
        dropoff: GeoPoint::new(PICKUP.0, PICKUP.1 + 0.05),
        service_id: None,
        category_id: None,
        distance_km: 5.0,
        duration_min: 10.0,
        fare,
        state: JobState::Completed,
        otp: None,
        participants: Vec::new(),
        seats_available: 0,
        payment_method: method,
        payment_status: PaymentStatus::Pending,
        rejected_driver_ids: BTreeSet::new(),
        created_at: now,
        updated_at: now,
        accepted_at: Some(now),
        started_at: Some(now),
        completed_at: Some(now),
        cancelled_at: None,
    };
    state.store.insert_job(job.clone());
    job
}
