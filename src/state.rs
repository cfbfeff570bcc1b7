use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

use crate::config::{Config, PackageTariff};
use crate::engine::otp::OtpGate;
use crate::error::AppError;
use crate::models::notification::Notification;
use crate::notify::{BroadcastDispatch, NotificationDispatch};
use crate::observability::metrics::Metrics;
use crate::payment::{self, PaymentSession};
use crate::store::Store;

pub struct AppState {
    pub store: Store,
    pub otp: OtpGate,
    pub tariff: PackageTariff,
    pub match_radius_meters: f64,
    pub payment_currency: String,
    pub payment_timeout: Duration,
    pub notifier: Arc<dyn NotificationDispatch>,
    pub payments: Arc<dyn PaymentSession>,
    pub events_tx: broadcast::Sender<Notification>,
    pub metrics: Metrics,
}

impl AppState {
    /// Wires the default collaborators: the in-process event broadcast and
    /// the payment provider described by `config`.
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let payments = payment::from_config(&config.payment)
            .map_err(|err| AppError::Internal(format!("payment client: {err}")))?;

        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);
        let notifier = Arc::new(BroadcastDispatch::new(events_tx.clone()));

        Ok(Self::assemble(config, notifier, payments, events_tx))
    }

    pub fn with_collaborators(
        config: &Config,
        notifier: Arc<dyn NotificationDispatch>,
        payments: Arc<dyn PaymentSession>,
    ) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);
        Self::assemble(config, notifier, payments, events_tx)
    }

    fn assemble(
        config: &Config,
        notifier: Arc<dyn NotificationDispatch>,
        payments: Arc<dyn PaymentSession>,
        events_tx: broadcast::Sender<Notification>,
    ) -> Self {
        Self {
            store: Store::new(),
            otp: OtpGate::new(&config.otp),
            tariff: config.tariff.clone(),
            match_radius_meters: config.matching.radius_meters,
            payment_currency: config.payment.currency.clone(),
            payment_timeout: config.payment.timeout,
            notifier,
            payments,
            events_tx,
            metrics: Metrics::new(),
        }
    }

    /// Publishes `notification`, logging instead of failing: by the time we
    /// notify, the state change is already committed.
    pub async fn notify(&self, notification: Notification) {
        let receiver_id = notification.receiver_id;
        let job_id = notification.job_id;
        let kind = notification.kind;

        if let Err(err) = self.notifier.publish(notification).await {
            self.metrics.notifications_failed_total.inc();
            warn!(
                receiver_id = %receiver_id,
                job_id = %job_id,
                kind = ?kind,
                error = %err,
                "failed to publish notification"
            );
        }
    }

    pub async fn notify_all(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.notify(notification).await;
        }
    }
}
