//! The broker consumer: declares topology, consumes the main queue, and
//! turns each delivery into exactly one of the terminal outcomes §8's
//! "no silent loss" property names -- acked with the effect done, acked
//! with a retry published, acked with a DLQ publish, or nacked-and-requeued
//! when even the retry/DLQ publish itself failed.
//!
//! Dispatch decisions are computed by the pure [`policy::decide`] function;
//! this module is the imperative shell around it -- building the envelope
//! from the wire delivery, calling the handler registry, running the
//! decision through the retry publisher, and acking or nacking.

mod error;
pub mod metrics;
mod policy;

pub use error::EngineError;
pub use policy::Decision;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deadpool_lapin::{Manager, Pool, Runtime};
use effect_handlers::HandlerRegistry;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::ConnectionProperties;
use message_model::{Envelope, HeaderValue};
use retry_publisher::RetryPublisher;
use tracing::{error, info, warn};

pub use broker_topology::TopologyConfig;

const MAX_UNKNOWN_KEY_LOG_LEN: usize = 100;
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub amqp_url: String,
    pub consumer_tag: String,
    pub prefetch: u16,
    pub max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            amqp_url: "amqp://127.0.0.1:5672/%2f".to_string(),
            consumer_tag: "delivery-engine".to_string(),
            prefetch: 10,
            max_attempts: 5,
        }
    }
}

pub struct DeliveryEngine {
    pool: Pool,
    topology: TopologyConfig,
    config: EngineConfig,
    registry: Arc<HandlerRegistry>,
    publisher: Arc<RetryPublisher>,
    metrics: metrics::EngineMetrics,
}

impl DeliveryEngine {
    pub fn connect(
        config: EngineConfig,
        topology: TopologyConfig,
        registry: Arc<HandlerRegistry>,
        publisher: Arc<RetryPublisher>,
    ) -> Result<Self, EngineError> {
        let manager = Manager::new(config.amqp_url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(4)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        let metrics = metrics::EngineMetrics::new(&topology.domain);
        Ok(Self {
            pool,
            topology,
            config,
            registry,
            publisher,
            metrics,
        })
    }

    /// Reconnection supervisor: on any transport failure, tear down and
    /// rebuild with capped exponential back-off (1s -> 30s). A topology
    /// mismatch is fatal and is propagated instead of retried, per §4.2.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), EngineError> {
        let mut backoff = MIN_BACKOFF;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(&mut shutdown).await {
                Ok(()) => return Ok(()),
                Err(EngineError::TopologyMismatch(msg)) => {
                    error!(error = %msg, "fatal topology mismatch, delivery engine terminating");
                    return Err(EngineError::TopologyMismatch(msg));
                }
                Err(e) => {
                    self.metrics.reconnects.inc();
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "delivery engine connection lost, reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return Ok(());
                            }
                        }
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn run_once(&self, shutdown: &mut tokio::sync::watch::Receiver<bool>) -> Result<(), EngineError> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        broker_topology::declare(&channel, &self.topology)
            .await
            .map_err(|e| match e {
                broker_topology::TopologyError::Mismatch { entity, source } => {
                    EngineError::TopologyMismatch(format!("{entity}: {source}"))
                }
                broker_topology::TopologyError::Broker { entity, source } => {
                    EngineError::Connection(format!("{entity}: {source}"))
                }
            })?;

        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        let mut consumer = channel
            .basic_consume(
                &self.topology.main_queue,
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        info!(queue = %self.topology.main_queue, prefetch = self.config.prefetch, "delivery engine consuming");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    changed.map_err(|_| EngineError::StreamEnded)?;
                    if *shutdown.borrow() {
                        info!("delivery engine shutting down");
                        return Ok(());
                    }
                }
                next = consumer.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            self.metrics.delivered.inc();
                            self.handle_delivery(delivery).await;
                        }
                        Some(Err(e)) => return Err(EngineError::Connection(e.to_string())),
                        None => return Err(EngineError::StreamEnded),
                    }
                }
            }
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let envelope = envelope_from_delivery(&delivery);
        let routing_key = envelope.routing_key.clone();

        let Some(handler) = self.registry.get(&routing_key) else {
            let truncated: String = routing_key.chars().take(MAX_UNKNOWN_KEY_LOG_LEN).collect();
            warn!(routing_key = %truncated, "unknown routing key, dropping delivery");
            self.metrics.unknown_routing_key.inc();
            self.ack(&delivery).await;
            return;
        };

        let outcome = handler.dispatch(&envelope.body).await;
        let decision = policy::decide(envelope.attempt(), self.config.max_attempts, &outcome);

        match decision {
            Decision::Ack => {
                self.metrics.acked.inc();
                self.ack(&delivery).await;
            }
            Decision::Retry { tier, next_attempt, cause } => {
                match self.publisher.publish_retry(&envelope, tier, next_attempt, &cause).await {
                    Ok(()) => {
                        self.metrics.retried.with_label_values(&[tier.queue_name()]).inc();
                        self.ack(&delivery).await;
                    }
                    Err(e) => {
                        warn!(error = %e, routing_key = %routing_key, "retry publish failed, requeueing");
                        self.metrics.requeued_on_publish_failure.inc();
                        self.nack_requeue(&delivery).await;
                    }
                }
            }
            Decision::Dlq { reason, cause } => {
                match self.publisher.publish_final(&envelope, reason, &cause).await {
                    Ok(()) => {
                        self.metrics.dead_lettered.with_label_values(&[reason.as_str()]).inc();
                        self.ack(&delivery).await;
                    }
                    Err(e) => {
                        warn!(error = %e, routing_key = %routing_key, "dlq publish failed, requeueing");
                        self.metrics.requeued_on_publish_failure.inc();
                        self.nack_requeue(&delivery).await;
                    }
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(error = %e, tag = ?delivery.delivery_tag, "ack failed");
        }
    }

    async fn nack_requeue(&self, delivery: &Delivery) {
        let opts = BasicNackOptions {
            multiple: false,
            requeue: true,
        };
        if let Err(e) = delivery.nack(opts).await {
            error!(error = %e, tag = ?delivery.delivery_tag, "nack failed");
        }
    }
}

/// Build the transport-independent [`Envelope`] this workspace's other
/// components operate on from a raw `lapin` delivery.
fn envelope_from_delivery(delivery: &Delivery) -> Envelope {
    let mut headers = HashMap::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.into_iter() {
            let header_value = match value {
                AMQPValue::LongString(s) => HeaderValue::Str(s.to_string()),
                AMQPValue::ShortString(s) => HeaderValue::Str(s.to_string()),
                AMQPValue::ShortShortInt(i) => HeaderValue::Int(*i as i64),
                AMQPValue::ShortInt(i) => HeaderValue::Int(*i as i64),
                AMQPValue::LongInt(i) => HeaderValue::Int(*i as i64),
                AMQPValue::LongUInt(i) => HeaderValue::Int(*i as i64),
                AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
                _ => continue,
            };
            headers.insert(key.to_string(), header_value);
        }
    }

    let timestamp = delivery
        .properties
        .timestamp()
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0))
        .unwrap_or_else(Utc::now);

    Envelope {
        routing_key: delivery.routing_key.to_string(),
        body: delivery.data.clone(),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "application/json".to_string()),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_default(),
        correlation_id: delivery.properties.correlation_id().as_ref().map(|s| s.to_string()),
        headers,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_truncation_never_exceeds_the_log_limit() {
        let long_key = "x".repeat(500);
        let truncated: String = long_key.chars().take(MAX_UNKNOWN_KEY_LOG_LEN).collect();
        assert_eq!(truncated.len(), MAX_UNKNOWN_KEY_LOG_LEN);
    }

    #[test]
    fn backoff_caps_at_thirty_seconds() {
        let mut backoff = MIN_BACKOFF;
        for _ in 0..10 {
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        assert_eq!(backoff, MAX_BACKOFF);
    }
}
