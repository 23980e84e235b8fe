use prometheus::{IntCounter, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct ReaperMetrics {
    pub records_reaped: IntCounter,
    pub object_delete_failures: IntCounter,
}

impl ReaperMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let records_reaped = IntCounter::with_opts(
            Opts::new("stale_reaper_records_reaped_total", "Upload records deleted for being stale")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for stale_reaper_records_reaped_total");

        let object_delete_failures = IntCounter::with_opts(
            Opts::new(
                "stale_reaper_object_delete_failures_total",
                "Raw object deletes that failed during a reap pass (non-fatal, logged and skipped)",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for stale_reaper_object_delete_failures_total");

        for metric in [
            Box::new(records_reaped.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(object_delete_failures.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!(error = %e, "failed to register stale reaper metric");
            }
        }

        Self {
            records_reaped,
            object_delete_failures,
        }
    }
}
