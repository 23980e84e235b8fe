//! The message topology, declared bit-exact enough that two independent
//! processes (the messaging worker and the upload API) both starting cold
//! will agree on the same exchanges and queues.
//!
//! Declaration is idempotent: re-declaring the same topology with the same
//! arguments is a no-op. Re-declaring with *different* arguments is a
//! `PRECONDITION_FAILED` from the broker, which this module surfaces as
//! [`TopologyError::Mismatch`] rather than swallowing it -- silently
//! re-declaring would mask an operator error (a queue TTL changed out from
//! under a running deployment, say).

use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, ShortString},
    Channel, ExchangeKind,
};
use message_model::RetryTier;
use thiserror::Error;

pub const FINAL_DLQ_EXCHANGE: &str = "X_final";
pub const FINAL_DLQ_QUEUE: &str = "Q_final";

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("topology precondition mismatch on {entity}: {source}")]
    Mismatch {
        entity: String,
        #[source]
        source: lapin::Error,
    },
    #[error("broker error declaring {entity}: {source}")]
    Broker {
        entity: String,
        #[source]
        source: lapin::Error,
    },
}

fn classify(entity: &str, err: lapin::Error) -> TopologyError {
    let text = err.to_string();
    if text.contains("PRECONDITION_FAILED") {
        TopologyError::Mismatch {
            entity: entity.to_string(),
            source: err,
        }
    } else {
        TopologyError::Broker {
            entity: entity.to_string(),
            source: err,
        }
    }
}

/// Caller-supplied shape of the main business topology. The four DLX/retry
/// exchanges and queues are fixed by the protocol; only the main exchange,
/// main queue, its bindings, and the domain used for the final routing key
/// vary per deployment.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    pub main_exchange: String,
    pub main_queue: String,
    pub binding_keys: Vec<String>,
    pub domain: String,
}

impl TopologyConfig {
    pub fn final_routing_key(&self) -> String {
        format!("{}.final.dlq", self.domain)
    }
}

/// Declare the full topology on the given channel. Safe to call from every
/// process that talks to this broker; the first caller wins and everyone
/// else's declare is a confirming no-op.
pub async fn declare(channel: &Channel, config: &TopologyConfig) -> Result<(), TopologyError> {
    channel
        .exchange_declare(
            &config.main_exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| classify("main exchange", e))?;

    for tier in [RetryTier::TenSeconds, RetryTier::OneMinute, RetryTier::TenMinutes] {
        channel
            .exchange_declare(
                tier.exchange_name(),
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(tier.exchange_name(), e))?;
    }

    channel
        .exchange_declare(
            FINAL_DLQ_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| classify(FINAL_DLQ_EXCHANGE, e))?;

    let mut main_args = FieldTable::default();
    main_args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(FINAL_DLQ_EXCHANGE.into()),
    );
    main_args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(config.final_routing_key().into()),
    );
    channel
        .queue_declare(
            &config.main_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            main_args,
        )
        .await
        .map_err(|e| classify(&config.main_queue, e))?;

    for key in &config.binding_keys {
        channel
            .queue_bind(
                &config.main_queue,
                &config.main_exchange,
                key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&config.main_queue, e))?;
    }

    for tier in [RetryTier::TenSeconds, RetryTier::OneMinute, RetryTier::TenMinutes] {
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongUInt(tier.ttl_ms()),
        );
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(config.main_exchange.as_str().into()),
        );
        channel
            .queue_declare(
                tier.queue_name(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| classify(tier.queue_name(), e))?;

        channel
            .queue_bind(
                tier.queue_name(),
                tier.exchange_name(),
                "#",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(tier.queue_name(), e))?;
    }

    channel
        .queue_declare(
            FINAL_DLQ_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| classify(FINAL_DLQ_QUEUE, e))?;

    channel
        .queue_bind(
            FINAL_DLQ_QUEUE,
            FINAL_DLQ_EXCHANGE,
            &config.final_routing_key(),
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| classify(FINAL_DLQ_QUEUE, e))?;

    tracing::info!(
        main_exchange = %config.main_exchange,
        main_queue = %config.main_queue,
        binding_keys = ?config.binding_keys,
        "topology declared"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_routing_key_is_domain_scoped() {
        let config = TopologyConfig {
            main_exchange: "X_main".into(),
            main_queue: "Q_main".into(),
            binding_keys: vec!["auth.#".into()],
            domain: "auth".into(),
        };
        assert_eq!(config.final_routing_key(), "auth.final.dlq");
    }
}
