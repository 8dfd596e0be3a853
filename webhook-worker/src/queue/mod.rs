//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The reference message format for the work queue
//! - The broker topology (work queue, dead letters, sync hand-off, pub/sub)
//! - An async publisher shared by every outbound path

pub mod publisher;
pub mod types;

use async_trait::async_trait;

use crate::error::EnqueueError;

pub use publisher::{declare_topology, Publisher};
pub use types::{
    QueueMessage, WorkerMessage, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE,
    INTEGRATION_SYNC_QUEUE, PROCESS_WEBHOOK_TYPE, PUBSUB_EXCHANGE, WEBHOOK_QUEUE,
};

/// Places event references on the durable work queue.
///
/// Delivery is at-least-once; consumers must tolerate duplicates.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), EnqueueError>;
}
