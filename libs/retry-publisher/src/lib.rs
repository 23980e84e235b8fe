//! Publishes to the tiered delay exchanges and the final DLQ, waiting for a
//! definitive publisher-confirm outcome on every publish so a lost retry
//! never disappears silently.
//!
//! Each publish acquires its own channel from a small pool rather than
//! sharing one channel across callers: confirms and mandatory-returns are
//! per-channel state, and serializing unrelated publishes behind one
//! channel's confirm wait would throttle the whole engine on a single slow
//! broker round trip.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use deadpool_lapin::{Manager, Pool, Runtime};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, ConnectionProperties};
use message_model::{DlqReason, Envelope, HeaderValue, RetryTier};
use thiserror::Error;
use tokio::sync::oneshot;

pub use broker_topology::TopologyConfig;

#[derive(Debug, Error)]
pub enum PublishFailure {
    #[error("broker nacked the publish")]
    Nack,
    #[error("message was unroutable (mandatory publish returned)")]
    NoRoute,
    #[error("timed out waiting for a publisher confirm")]
    Timeout,
    #[error("publish was cancelled")]
    Cancelled,
    #[error("could not acquire a broker channel: {0}")]
    Connection(String),
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub amqp_url: String,
    pub confirm_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            amqp_url: "amqp://127.0.0.1:5672/%2f".to_string(),
            confirm_timeout: Duration::from_millis(250),
        }
    }
}

pub struct RetryPublisher {
    pool: Pool,
    topology: TopologyConfig,
    confirm_timeout: Duration,
}

impl RetryPublisher {
    pub fn connect(config: PublisherConfig, topology: TopologyConfig) -> Result<Self, PublishFailure> {
        let manager = Manager::new(config.amqp_url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| PublishFailure::Connection(e.to_string()))?;
        Ok(Self {
            pool,
            topology,
            confirm_timeout: config.confirm_timeout,
        })
    }

    async fn confirmed_channel(&self) -> Result<Channel, PublishFailure> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| PublishFailure::Connection(e.to_string()))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| PublishFailure::Connection(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| PublishFailure::Connection(e.to_string()))?;
        Ok(channel)
    }

    /// Publish a brand-new message to the main exchange under its own
    /// routing key, for callers outside the Delivery Engine that need to
    /// hand work to it (the Upload Coordinator, handing a completed upload
    /// off to the image-processing handler) without running the engine
    /// itself.
    pub async fn publish_initial(&self, envelope: &Envelope) -> Result<(), PublishFailure> {
        let exchange = self.topology.main_exchange.clone();
        let routing_key = envelope.routing_key.clone();
        self.publish(&exchange, &routing_key, envelope).await
    }

    /// `publish_retry(tier, original_delivery, next_attempt, cause)`.
    pub async fn publish_retry(
        &self,
        original: &Envelope,
        tier: RetryTier,
        next_attempt: u32,
        cause: &str,
    ) -> Result<(), PublishFailure> {
        let envelope = original.for_retry(next_attempt, cause);
        self.publish(tier.exchange_name(), &envelope.routing_key, &envelope)
            .await
    }

    /// `publish_final(original_delivery, reason, cause)`.
    pub async fn publish_final(
        &self,
        original: &Envelope,
        reason: DlqReason,
        cause: &str,
    ) -> Result<(), PublishFailure> {
        let mut envelope = original.for_dlq(reason.as_str());
        envelope
            .headers
            .insert("x-error".to_string(), cause.to_string().into());
        let routing_key = self.topology.final_routing_key();
        self.publish(broker_topology::FINAL_DLQ_EXCHANGE, &routing_key, &envelope)
            .await
    }

    fn headers_table(envelope: &Envelope) -> FieldTable {
        let mut table = FieldTable::default();
        for (key, value) in &envelope.headers {
            let amqp_value = match value {
                HeaderValue::Str(s) => AMQPValue::LongString(s.as_str().into()),
                HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
            };
            table.insert(ShortString::from(key.as_str()), amqp_value);
        }
        table
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), PublishFailure> {
        let channel = self.confirmed_channel().await?;

        let (return_tx, return_rx) = oneshot::channel();
        let return_tx = Arc::new(Mutex::new(Some(return_tx)));
        {
            let return_tx = return_tx.clone();
            channel.on_return(move |returned| {
                if let Some(tx) = return_tx.lock().expect("return slot poisoned").take() {
                    let _ = tx.send(returned);
                }
            });
        }

        let properties = BasicProperties::default()
            .with_content_type(envelope.content_type.clone().into())
            .with_delivery_mode(2)
            .with_message_id(envelope.message_id.clone().into())
            .with_headers(Self::headers_table(envelope));
        let properties = if let Some(correlation_id) = &envelope.correlation_id {
            properties.with_correlation_id(correlation_id.clone().into())
        } else {
            properties
        };

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| PublishFailure::Connection(e.to_string()))?;

        tokio::select! {
            biased;
            returned = return_rx => {
                if returned.is_ok() {
                    return Err(PublishFailure::NoRoute);
                }
                Err(PublishFailure::Cancelled)
            }
            outcome = tokio::time::timeout(self.confirm_timeout, confirm) => {
                match outcome {
                    Ok(Ok(Confirmation::Ack(_))) | Ok(Ok(Confirmation::NotRequested)) => Ok(()),
                    Ok(Ok(Confirmation::Nack(_))) => Err(PublishFailure::Nack),
                    Ok(Err(e)) => Err(PublishFailure::Connection(e.to_string())),
                    Err(_elapsed) => Err(PublishFailure::Timeout),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_confirm_window_is_250ms() {
        assert_eq!(PublisherConfig::default().confirm_timeout, Duration::from_millis(250));
    }
}
