//! Queue worker: consumes event references and applies their effects.
//!
//! ```text
//! hookline.webhooks → consumer → processor ─┬→ tenant billing state
//!                                            ├→ api-pubsub
//!                                            └→ hookline.integration_sync
//! ```

pub mod consumer;
pub mod processor;
pub mod tenant_lock;

use async_trait::async_trait;

use crate::error::ProcessError;
use crate::model::IncomingEvent;

pub use consumer::{run_consumer, ConsumerSettings};
pub use processor::{Outcome, WebhookProcessor, ALERT_TARGET, MAX_CONFLICT_RETRIES};
pub use tenant_lock::TenantLocks;

/// Hands source-control events to the integration-specific sync service.
#[async_trait]
pub trait IntegrationSync: Send + Sync {
    async fn forward(&self, event: &IncomingEvent) -> Result<(), ProcessError>;
}
