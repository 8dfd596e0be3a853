//! In-process fakes for the broker and billing provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::billing::{BillingProvider, Subscription};
use crate::error::{EnqueueError, NotifyError, ProcessError};
use crate::model::IncomingEvent;
use crate::notify::{NotificationMessage, Notifier};
use crate::queue::{Dispatcher, QueueMessage};
use crate::worker::IntegrationSync;

/// Records everything sent to the work queue, pub/sub and sync hand-off.
#[derive(Clone, Default)]
pub struct RecordingQueue {
    messages: Arc<Mutex<Vec<QueueMessage>>>,
    notifications: Arc<Mutex<Vec<NotificationMessage>>>,
    forwarded: Arc<Mutex<Vec<IncomingEvent>>>,
    fail_next: Arc<AtomicBool>,
}

impl RecordingQueue {
    /// Make the next enqueue or notification fail.
    pub fn fail_next(&self, fail: bool) {
        self.fail_next.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<QueueMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<NotificationMessage> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn forwarded(&self) -> Vec<IncomingEvent> {
        self.forwarded.lock().unwrap().clone()
    }

    fn take_failure(&self) -> bool {
        self.fail_next.swap(false, Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for RecordingQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), EnqueueError> {
        if self.take_failure() {
            return Err(EnqueueError("broker unavailable".to_string()));
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingQueue {
    async fn publish(&self, message: &NotificationMessage) -> Result<(), NotifyError> {
        if self.take_failure() {
            return Err(NotifyError("pubsub unavailable".to_string()));
        }
        self.notifications.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[async_trait]
impl IntegrationSync for RecordingQueue {
    async fn forward(&self, event: &IncomingEvent) -> Result<(), ProcessError> {
        self.forwarded.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Billing provider backed by a fixed subscription table.
#[derive(Clone, Default)]
pub struct FakeBilling {
    subscriptions: Arc<Mutex<HashMap<String, Subscription>>>,
    unavailable: Arc<AtomicBool>,
}

impl FakeBilling {
    pub fn with_subscription(
        self,
        id: &str,
        product_id: &str,
        current_period_end: DateTime<Utc>,
    ) -> Self {
        self.subscriptions.lock().unwrap().insert(
            id.to_string(),
            Subscription {
                id: id.to_string(),
                product_id: product_id.to_string(),
                current_period_end,
            },
        );
        self
    }

    /// Simulate a provider outage.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingProvider for FakeBilling {
    async fn retrieve_subscription(&self, id: &str) -> Result<Subscription, ProcessError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProcessError::Transient("billing provider unavailable".to_string()));
        }
        self.subscriptions
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ProcessError::DataIntegrity(format!("subscription {id} not found")))
    }
}
