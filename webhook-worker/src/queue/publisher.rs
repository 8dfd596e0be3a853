//! Async RabbitMQ publisher.
//!
//! One publisher serves every outbound path: event references onto the work
//! queue, source-control hand-offs, and pub/sub notifications. It keeps a
//! persistent confirm-mode channel and reconnects on demand.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::types::{
    QueueMessage, WorkerMessage, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE,
    INTEGRATION_SYNC_QUEUE, PROCESS_WEBHOOK_TYPE, PUBSUB_EXCHANGE, WEBHOOK_QUEUE,
};
use super::Dispatcher;
use crate::error::{EnqueueError, NotifyError, ProcessError};
use crate::model::IncomingEvent;
use crate::notify::{NotificationMessage, Notifier};
use crate::worker::IntegrationSync;

/// Declare every exchange and queue the pipeline uses. Idempotent, so both
/// binaries call it on connect.
///
/// The work queue is a quorum queue so the broker itself enforces the
/// redelivery budget (`x-delivery-limit`) and dead-letters exhausted messages.
pub async fn declare_topology(channel: &Channel, delivery_limit: u32) -> Result<()> {
    channel
        .exchange_declare(
            DEAD_LETTER_EXCHANGE,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare dead-letter exchange")?;

    channel
        .queue_declare(
            DEAD_LETTER_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare dead-letter queue")?;

    channel
        .queue_bind(
            DEAD_LETTER_QUEUE,
            DEAD_LETTER_EXCHANGE,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to bind dead-letter queue")?;

    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-queue-type"),
        AMQPValue::LongString(LongString::from("quorum")),
    );
    args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from(DEAD_LETTER_EXCHANGE)),
    );
    args.insert(
        ShortString::from("x-delivery-limit"),
        AMQPValue::LongInt(delivery_limit.min(i32::MAX as u32) as i32),
    );

    channel
        .queue_declare(
            WEBHOOK_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await
        .context("Failed to declare webhook queue")?;

    channel
        .queue_declare(
            INTEGRATION_SYNC_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare integration sync queue")?;

    channel
        .exchange_declare(
            PUBSUB_EXCHANGE,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to declare pub/sub exchange")?;

    info!(
        webhook_queue = WEBHOOK_QUEUE,
        dead_letter_queue = DEAD_LETTER_QUEUE,
        sync_queue = INTEGRATION_SYNC_QUEUE,
        pubsub_exchange = PUBSUB_EXCHANGE,
        delivery_limit = delivery_limit,
        "rabbitmq_topology_declared"
    );

    Ok(())
}

/// Async RabbitMQ publisher with connection management.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    url: String,
    delivery_limit: u32,
    publish_timeout: Duration,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl Publisher {
    /// Create a publisher. Nothing connects until the first publish.
    pub fn new(url: String, delivery_limit: u32, publish_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url,
                delivery_limit,
                publish_timeout,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        info!("rabbitmq_publisher_connected");

        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        declare_topology(&ch, self.inner.delivery_limit).await?;

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Publish a JSON body and wait for the broker's confirm.
    async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let attempt = async {
            let channel = self.ensure_connected().await?;

            let confirmation = channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    properties.with_content_type("application/json".into()),
                )
                .await
                .context("Failed to publish")?
                .await
                .context("Failed to confirm publish")?;

            if confirmation.is_nack() {
                bail!("broker rejected message for {routing_key}");
            }

            Ok::<(), anyhow::Error>(())
        };

        match tokio::time::timeout(self.inner.publish_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => bail!(
                "publish to {routing_key} timed out after {}ms",
                self.inner.publish_timeout.as_millis()
            ),
        }
    }

    /// Publish an event reference onto the work queue.
    pub async fn publish_webhook(&self, message: &QueueMessage) -> Result<()> {
        let body = serde_json::to_vec(&WorkerMessage::ProcessWebhook(message.clone()))
            .context("Failed to serialize queue message")?;

        let mut headers = FieldTable::default();
        if let Some(tenant_id) = &message.tenant_id {
            headers.insert(
                ShortString::from("x-tenant-id"),
                AMQPValue::LongString(LongString::from(tenant_id.clone())),
            );
        }

        let properties = BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_type(ShortString::from(PROCESS_WEBHOOK_TYPE))
            .with_message_id(ShortString::from(message.event_id.to_string()))
            .with_headers(headers);

        self.publish_raw("", WEBHOOK_QUEUE, &body, properties).await?;

        info!(
            queue = WEBHOOK_QUEUE,
            event_id = %message.event_id,
            tenant_id = ?message.tenant_id,
            body_length = body.len(),
            "rabbitmq_webhook_published"
        );

        Ok(())
    }

    /// Hand a source-control event to the integration sync consumers.
    pub async fn publish_integration_sync(&self, event: &IncomingEvent) -> Result<()> {
        let body = serde_json::to_vec(event).context("Failed to serialize event")?;

        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_message_id(ShortString::from(event.id.to_string()));

        self.publish_raw("", INTEGRATION_SYNC_QUEUE, &body, properties)
            .await?;

        info!(
            queue = INTEGRATION_SYNC_QUEUE,
            event_id = %event.id,
            event_kind = ?event.event_kind,
            "rabbitmq_integration_sync_published"
        );

        Ok(())
    }

    /// Broadcast a notification on the pub/sub exchange.
    pub async fn publish_notification(&self, message: &NotificationMessage) -> Result<()> {
        let body = serde_json::to_vec(message).context("Failed to serialize notification")?;

        self.publish_raw(
            PUBSUB_EXCHANGE,
            &message.channel,
            &body,
            BasicProperties::default(),
        )
        .await?;

        info!(
            exchange = PUBSUB_EXCHANGE,
            channel = %message.channel,
            event_name = %message.event_name,
            tenant_scope = ?message.tenant_scope,
            "rabbitmq_notification_published"
        );

        Ok(())
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

#[async_trait]
impl Dispatcher for Publisher {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), EnqueueError> {
        self.publish_webhook(message)
            .await
            .map_err(|e| EnqueueError(format!("{e:#}")))
    }
}

#[async_trait]
impl Notifier for Publisher {
    async fn publish(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        self.publish_notification(message)
            .await
            .map_err(|e| NotifyError(format!("{e:#}")))
    }
}

#[async_trait]
impl IntegrationSync for Publisher {
    async fn forward(&self, event: &IncomingEvent) -> Result<(), ProcessError> {
        self.publish_integration_sync(event)
            .await
            .map_err(|e| ProcessError::Transient(format!("{e:#}")))
    }
}
