use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub jobs_created_total: IntCounterVec,
    pub transitions_total: IntCounterVec,
    pub settlements_total: IntCounterVec,
    pub settlement_latency_seconds: HistogramVec,
    pub notifications_failed_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_created_total = IntCounterVec::new(
            Opts::new("jobs_created_total", "Jobs created by kind"),
            &["kind"],
        )
        .expect("valid jobs_created_total metric");

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "transitions_total",
                "Lifecycle operations by transition and outcome",
            ),
            &["transition", "outcome"],
        )
        .expect("valid transitions_total metric");

        let settlements_total = IntCounterVec::new(
            Opts::new("settlements_total", "Settlements by payment method and outcome"),
            &["method", "outcome"],
        )
        .expect("valid settlements_total metric");

        let settlement_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "settlement_latency_seconds",
                "Latency of settlement including payment session creation",
            ),
            &["outcome"],
        )
        .expect("valid settlement_latency_seconds metric");

        let notifications_failed_total = IntCounter::new(
            "notifications_failed_total",
            "Notifications that could not be published",
        )
        .expect("valid notifications_failed_total metric");

        registry
            .register(Box::new(jobs_created_total.clone()))
            .expect("register jobs_created_total");
        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register transitions_total");
        registry
            .register(Box::new(settlements_total.clone()))
            .expect("register settlements_total");
        registry
            .register(Box::new(settlement_latency_seconds.clone()))
            .expect("register settlement_latency_seconds");
        registry
            .register(Box::new(notifications_failed_total.clone()))
            .expect("register notifications_failed_total");

        Self {
            registry,
            jobs_created_total,
            transitions_total,
            settlements_total,
            settlement_latency_seconds,
            notifications_failed_total,
        }
    }

    pub fn record_transition<T, E>(&self, transition: &str, result: &Result<T, E>) {
        let outcome = if result.is_ok() { "success" } else { "error" };
        self.transitions_total
            .with_label_values(&[transition, outcome])
            .inc();
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
