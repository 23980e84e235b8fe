use prometheus::{IntCounter, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct CoordinatorMetrics {
    pub requests: IntCounter,
    pub completions: IntCounter,
    pub oversize_rejections: IntCounter,
    pub publish_failures: IntCounter,
}

impl CoordinatorMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let requests = IntCounter::with_opts(
            Opts::new("upload_coordinator_requests_total", "Upload requests issued")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for upload_coordinator_requests_total");

        let completions = IntCounter::with_opts(
            Opts::new("upload_coordinator_completions_total", "Uploads transitioned to UPLOADED")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for upload_coordinator_completions_total");

        let oversize_rejections = IntCounter::with_opts(
            Opts::new("upload_coordinator_oversize_rejections_total", "Uploads failed for exceeding max_bytes")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for upload_coordinator_oversize_rejections_total");

        let publish_failures = IntCounter::with_opts(
            Opts::new(
                "upload_coordinator_publish_failures_total",
                "Processing handoff publishes that failed (non-fatal, reaper re-drives)",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for upload_coordinator_publish_failures_total");

        for metric in [
            Box::new(requests.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(completions.clone()),
            Box::new(oversize_rejections.clone()),
            Box::new(publish_failures.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!(error = %e, "failed to register upload coordinator metric");
            }
        }

        Self {
            requests,
            completions,
            oversize_rejections,
            publish_failures,
        }
    }
}
