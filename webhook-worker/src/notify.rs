//! Real-time notifications for connected clients.
//!
//! Notifications are fire-and-forget: nothing is persisted and nothing is
//! replayed. The durable source of truth is the tenant record.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::NotifyError;
use crate::model::Plan;

/// Channel the API layer relays to a tenant's user sessions.
pub const USER_CHANNEL: &str = "user";

/// Event name clients listen for after a successful checkout.
pub const PLAN_UPGRADED_EVENT: &str = "tenant-plan-upgraded";

/// A message for live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub channel: String,
    pub event_name: String,
    /// JSON-encoded payload, passed through to clients untouched.
    pub payload: String,
    pub tenant_scope: Option<String>,
}

impl NotificationMessage {
    pub fn plan_upgraded(tenant_id: &str, plan: Plan, subscription_id: &str) -> Self {
        let payload = serde_json::json!({
            "plan": plan.as_str(),
            "stripeSubscriptionId": subscription_id,
        });

        Self {
            channel: USER_CHANNEL.to_string(),
            event_name: PLAN_UPGRADED_EVENT.to_string(),
            payload: payload.to_string(),
            tenant_scope: Some(tenant_id.to_string()),
        }
    }
}

/// Publishes to the pub/sub fabric. Zero subscribers is a normal outcome.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, message: &NotificationMessage) -> Result<(), NotifyError>;
}
