//! Webhook recorder: persists raw events before they are queued.
//!
//! Recording first means the queue only ever carries a reference, and a
//! crash between recording and enqueueing leaves an inspectable `pending`
//! row that can be re-driven.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::error::StoreError;
use crate::model::NewIncomingEvent;
use crate::store::{with_timeout, EventStore, Recorded};
use crate::verify::SourceControlDelivery;

#[derive(Clone)]
pub struct WebhookRecorder {
    events: Arc<dyn EventStore>,
    timeout: Duration,
}

impl WebhookRecorder {
    pub fn new(events: Arc<dyn EventStore>, timeout: Duration) -> Self {
        Self { events, timeout }
    }

    /// Persist an event. Fails only when the store is unavailable.
    pub async fn record(&self, event: NewIncomingEvent) -> Result<Recorded, StoreError> {
        let source_type = event.source_type;
        let tenant_id = event.tenant_id.clone();

        match with_timeout(self.timeout, self.events.record(event)).await {
            Ok(recorded) => {
                info!(
                    event_id = %recorded.event.id,
                    tenant_id = ?tenant_id,
                    source_type = %source_type,
                    event_kind = ?recorded.event.event_kind,
                    created = recorded.created,
                    "webhook_recorded"
                );
                Ok(recorded)
            }
            Err(e) => {
                error!(
                    tenant_id = ?tenant_id,
                    source_type = %source_type,
                    error = %e,
                    "webhook_record_failed"
                );
                Err(e)
            }
        }
    }
}

/// Stored layout for source-control deliveries: the signature and event
/// headers travel with the provider body.
pub fn source_control_payload(delivery: &SourceControlDelivery) -> serde_json::Value {
    serde_json::json!({
        "signature": delivery.signature,
        "event": delivery.event_kind,
        "data": delivery.data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProcessingState, SourceType};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_record_persists_pending_event() {
        let store = MemoryStore::new();
        let recorder = WebhookRecorder::new(Arc::new(store.clone()), Duration::from_secs(1));

        let recorded = recorder
            .record(NewIncomingEvent {
                tenant_id: Some("t1".to_string()),
                integration_id: Some("int_1".to_string()),
                source_type: SourceType::SourceControl,
                event_kind: Some("push".to_string()),
                provider_event_id: Some("delivery-1".to_string()),
                raw_payload: serde_json::json!({"data": {}}),
            })
            .await
            .unwrap();

        assert!(recorded.created);
        let stored = store.events().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, recorded.event.id);
        assert_eq!(stored[0].processing_state, ProcessingState::Pending);
        assert_eq!(stored[0].integration_id.as_deref(), Some("int_1"));
    }

    #[test]
    fn test_source_control_payload_layout() {
        let delivery = SourceControlDelivery {
            installation_id: "42".to_string(),
            event_kind: Some("pull_request".to_string()),
            delivery_id: None,
            signature: Some("sha256=ab".to_string()),
            data: serde_json::json!({"installation": {"id": 42}}),
        };

        let payload = source_control_payload(&delivery);
        assert_eq!(payload["signature"], "sha256=ab");
        assert_eq!(payload["event"], "pull_request");
        assert_eq!(payload["data"]["installation"]["id"], 42);
    }
}
