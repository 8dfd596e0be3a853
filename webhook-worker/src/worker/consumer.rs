//! RabbitMQ consumer loop for the work queue.
//!
//! Each delivery runs in its own task; prefetch bounds how many are in
//! flight. On shutdown the consumer is cancelled first, then in-flight tasks
//! get a grace period. Anything left unacked is redelivered by the broker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::processor::{Outcome, WebhookProcessor};
use crate::config::Config;
use crate::queue::{declare_topology, QueueMessage, WorkerMessage, WEBHOOK_QUEUE};

const CONSUMER_TAG: &str = "hookline-processor";

/// Consumer settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub amqp_url: String,
    pub concurrency: usize,
    pub delivery_limit: u32,
    pub grace: Duration,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            amqp_url: config.amqp_url.clone(),
            concurrency: config.worker_concurrency.max(1),
            delivery_limit: config.max_delivery_attempts,
            grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }
}

/// Decode a work queue body into the reference it carries.
pub fn decode(body: &[u8]) -> Result<QueueMessage, serde_json::Error> {
    match serde_json::from_slice::<WorkerMessage>(body)? {
        WorkerMessage::ProcessWebhook(message) => Ok(message),
    }
}

/// Broker-side redelivery count, set by quorum queues after the first attempt.
pub fn delivery_count(properties: &BasicProperties) -> Option<i64> {
    let headers = properties.headers().as_ref()?;
    let (_, value) = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "x-delivery-count")?;

    match value {
        AMQPValue::LongLongInt(n) => Some(*n),
        AMQPValue::LongInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortInt(n) => Some(i64::from(*n)),
        AMQPValue::LongUInt(n) => Some(i64::from(*n)),
        _ => None,
    }
}

/// Consume the work queue until `shutdown` resolves.
pub async fn run_consumer<S>(
    settings: ConsumerSettings,
    processor: Arc<WebhookProcessor>,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()>,
{
    info!(url_length = settings.amqp_url.len(), "rabbitmq_connecting");

    let conn = Connection::connect(&settings.amqp_url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");

    let channel = conn
        .create_channel()
        .await
        .context("Failed to create channel")?;

    let prefetch_count = u16::try_from(settings.concurrency).unwrap_or(u16::MAX);
    channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    info!(prefetch_count = prefetch_count, "rabbitmq_qos_set");

    declare_topology(&channel, settings.delivery_limit).await?;

    let mut consumer = channel
        .basic_consume(
            WEBHOOK_QUEUE,
            CONSUMER_TAG,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to start consumer")?;

    info!(queue = WEBHOOK_QUEUE, "rabbitmq_consumer_started");
    info!("processor_ready");

    let channel = Arc::new(channel);
    let mut tasks = JoinSet::new();

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("processor_stopping");
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "delivery_task_failed");
                }
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;
                        let attempts = delivery_count(&delivery.properties);

                        info!(
                            queue = WEBHOOK_QUEUE,
                            delivery_tag = delivery_tag,
                            redelivered = delivery.redelivered,
                            delivery_count = ?attempts,
                            body_length = delivery.data.len(),
                            "rabbitmq_webhook_received"
                        );

                        let processor = Arc::clone(&processor);
                        let channel = Arc::clone(&channel);

                        tasks.spawn(async move {
                            let outcome = match decode(&delivery.data) {
                                Ok(message) => processor.process(&message).await,
                                Err(e) => {
                                    error!(
                                        delivery_tag = delivery_tag,
                                        error = %e,
                                        body_preview = %String::from_utf8_lossy(
                                            &delivery.data[..delivery.data.len().min(500)]
                                        ),
                                        "webhook_message_parse_failed"
                                    );
                                    Outcome::Reject
                                }
                            };

                            settle(&channel, delivery_tag, outcome).await;
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = channel
        .basic_cancel(CONSUMER_TAG, BasicCancelOptions::default())
        .await
    {
        warn!(error = %e, "rabbitmq_cancel_failed");
    }

    info!(in_flight = tasks.len(), "processor_draining");

    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "delivery_task_failed");
            }
        }
    };

    if tokio::time::timeout(settings.grace, drain).await.is_err() {
        warn!(
            grace_secs = settings.grace.as_secs(),
            "processor_drain_timeout"
        );
        tasks.abort_all();
    }

    if let Err(e) = channel.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_channel_close_error");
    }
    if let Err(e) = conn.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_connection_close_error");
    }

    Ok(())
}

async fn settle(channel: &Channel, delivery_tag: u64, outcome: Outcome) {
    let result = match outcome {
        Outcome::Ack => {
            channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await
        }
        Outcome::Retry => {
            channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    },
                )
                .await
        }
        // Not requeued: the dead-letter exchange takes it.
        Outcome::Reject => {
            channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    },
                )
                .await
        }
    };

    if let Err(e) = result {
        error!(
            delivery_tag = delivery_tag,
            outcome = ?outcome,
            error = %e,
            "rabbitmq_settle_failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;
    use uuid::Uuid;

    #[test]
    fn test_decode_reference_envelope() {
        let id = Uuid::new_v4();
        let body = format!(
            r#"{{"type":"process_webhook","tenantId":"t1","eventId":"{id}","enqueuedAt":"2024-05-01T12:00:00Z"}}"#
        );

        let message = decode(body.as_bytes()).unwrap();
        assert_eq!(message.event_id, id);
        assert_eq!(message.tenant_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"not json").is_err());
        assert!(decode(br#"{"type":"process_webhook"}"#).is_err());
    }

    #[test]
    fn test_delivery_count_header() {
        assert_eq!(delivery_count(&BasicProperties::default()), None);

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("x-delivery-count"),
            AMQPValue::LongLongInt(3),
        );
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(delivery_count(&properties), Some(3));
    }

    #[test]
    fn test_settings_floor_concurrency() {
        let mut config = Config::from_env();
        config.worker_concurrency = 0;
        config.shutdown_grace_secs = 7;

        let settings = ConsumerSettings::from_config(&config);
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.grace, Duration::from_secs(7));
    }
}
