//! Hookline - tenant webhook ingestion and processing.
//!
//! This library provides shared modules for the two Hookline binaries:
//! - `hookline-web`: Thin receiver that verifies, records and enqueues
//! - `hookline-processor`: Worker that applies events to tenant state
//!
//! ## Architecture
//!
//! ```text
//! GitHub/Stripe → Web Server → incoming_webhooks + hookline.webhooks
//!                                                     ↓
//!        api-pubsub / hookline.integration_sync ← Processor → tenants
//! ```

pub mod billing;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod notify;
pub mod plans;
pub mod queue;
pub mod record;
pub mod store;
pub mod verify;
pub mod web;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use billing::{BillingProvider, StripeClient};
pub use config::Config;
pub use error::{IngestError, ProcessError, StoreError, VerifyError};
pub use ingest::{IngestOutcome, Ingestor};
pub use plans::PlanCatalog;
pub use queue::{Publisher, QueueMessage, WEBHOOK_QUEUE};
pub use record::WebhookRecorder;
pub use store::{MemoryStore, PgStore};
pub use web::AppState;
pub use worker::{Outcome, WebhookProcessor};
