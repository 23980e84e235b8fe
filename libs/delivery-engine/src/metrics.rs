use prometheus::{IntCounter, IntCounterVec, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct EngineMetrics {
    pub delivered: IntCounter,
    pub acked: IntCounter,
    pub unknown_routing_key: IntCounter,
    pub retried: IntCounterVec,
    pub dead_lettered: IntCounterVec,
    pub requeued_on_publish_failure: IntCounter,
    pub reconnects: IntCounter,
}

impl EngineMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let delivered = IntCounter::with_opts(
            Opts::new("delivery_engine_delivered_total", "Deliveries received from the main queue")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for delivery_engine_delivered_total");

        let acked = IntCounter::with_opts(
            Opts::new("delivery_engine_acked_total", "Deliveries acked after a successful effect")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for delivery_engine_acked_total");

        let unknown_routing_key = IntCounter::with_opts(
            Opts::new(
                "delivery_engine_unknown_routing_key_total",
                "Deliveries dropped because no handler is registered for their routing key",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for delivery_engine_unknown_routing_key_total");

        let retried = IntCounterVec::new(
            Opts::new("delivery_engine_retried_total", "Deliveries republished to a retry tier")
                .const_label("service", service.to_string()),
            &["tier"],
        )
        .expect("valid metric opts for delivery_engine_retried_total");

        let dead_lettered = IntCounterVec::new(
            Opts::new("delivery_engine_dead_lettered_total", "Deliveries published to the final DLQ")
                .const_label("service", service.to_string()),
            &["reason"],
        )
        .expect("valid metric opts for delivery_engine_dead_lettered_total");

        let requeued_on_publish_failure = IntCounter::with_opts(
            Opts::new(
                "delivery_engine_requeued_on_publish_failure_total",
                "Deliveries nacked with requeue because a retry/DLQ publish itself failed",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for delivery_engine_requeued_on_publish_failure_total");

        let reconnects = IntCounter::with_opts(
            Opts::new("delivery_engine_reconnects_total", "Broker reconnection attempts")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for delivery_engine_reconnects_total");

        for metric in [
            Box::new(delivered.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(acked.clone()),
            Box::new(unknown_routing_key.clone()),
            Box::new(retried.clone()),
            Box::new(dead_lettered.clone()),
            Box::new(requeued_on_publish_failure.clone()),
            Box::new(reconnects.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!(error = %e, "failed to register delivery engine metric");
            }
        }

        Self {
            delivered,
            acked,
            unknown_routing_key,
            retried,
            dead_lettered,
            requeued_on_publish_failure,
            reconnects,
        }
    }
}
