use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub drained: IntCounter,
}

impl OutboxMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let pending = IntGauge::with_opts(
            Opts::new(
                "outbox_pending_count",
                "Number of undrained outbox rows currently pending",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_pending_count");

        let oldest_pending_age_seconds = IntGauge::with_opts(
            Opts::new(
                "outbox_oldest_pending_age_seconds",
                "Age in seconds of the oldest pending outbox row",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_oldest_pending_age_seconds");

        let drained = IntCounter::with_opts(
            Opts::new(
                "outbox_drained_total",
                "Total number of outbox rows drained into the behavior log",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_drained_total");

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(drained.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!(error = %e, "failed to register outbox metric");
            }
        }

        Self {
            pending,
            oldest_pending_age_seconds,
            drained,
        }
    }
}
