//! Queue message types and broker topology names.
//!
//! ```text
//! Web Server → hookline.webhooks → Processor ─┬→ hookline.integration_sync
//!                    │ (delivery limit)        └→ api-pubsub (fanout)
//!                    └→ hookline.webhooks.dlx → hookline.webhooks.dead
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Work queue carrying event references from the receiver to the processor.
pub const WEBHOOK_QUEUE: &str = "hookline.webhooks";

/// Exchange receiving messages that ran out of delivery attempts.
pub const DEAD_LETTER_EXCHANGE: &str = "hookline.webhooks.dlx";

/// Queue holding dead-lettered messages for inspection.
pub const DEAD_LETTER_QUEUE: &str = "hookline.webhooks.dead";

/// Hand-off queue for integration-specific source-control sync.
pub const INTEGRATION_SYNC_QUEUE: &str = "hookline.integration_sync";

/// Fanout exchange the API layer relays to websocket clients.
pub const PUBSUB_EXCHANGE: &str = "api-pubsub";

/// Message type tag for event references.
pub const PROCESS_WEBHOOK_TYPE: &str = "process_webhook";

/// Reference to a recorded event. Never carries the payload itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Tenant the event was attributed to at ingestion, if any.
    pub tenant_id: Option<String>,
    pub event_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(tenant_id: Option<String>, event_id: Uuid) -> Self {
        Self {
            tenant_id,
            event_id,
            enqueued_at: Utc::now(),
        }
    }

    /// Key used to serialize processing: the tenant when known, otherwise the
    /// event itself.
    pub fn ordering_key(&self) -> String {
        self.tenant_id
            .clone()
            .unwrap_or_else(|| format!("event:{}", self.event_id))
    }
}

/// Envelope placed on the work queue, tagged so other message kinds can share
/// the queue later without breaking consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    ProcessWebhook(QueueMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_message_envelope_shape() {
        let id = Uuid::new_v4();
        let message = WorkerMessage::ProcessWebhook(QueueMessage::new(Some("t1".to_string()), id));

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], PROCESS_WEBHOOK_TYPE);
        assert_eq!(json["tenantId"], "t1");
        assert_eq!(json["eventId"], id.to_string());
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let json = r#"{"type": "reindex", "tenantId": "t1"}"#;
        assert!(serde_json::from_str::<WorkerMessage>(json).is_err());
    }

    #[test]
    fn test_ordering_key_falls_back_to_event() {
        let id = Uuid::new_v4();
        assert_eq!(
            QueueMessage::new(Some("t9".to_string()), id).ordering_key(),
            "t9"
        );
        assert_eq!(
            QueueMessage::new(None, id).ordering_key(),
            format!("event:{id}")
        );
    }
}
