//! Persistence contracts for events, tenants and integrations.
//!
//! The relational schema belongs to the wider system; these traits capture
//! the subset this pipeline reads and writes. `postgres` is the production
//! backend, `memory` backs tests and local runs.

pub mod memory;
pub mod postgres;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    IncomingEvent, Integration, NewIncomingEvent, PlatformType, ProcessingState, Tenant,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Result of recording an event.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub event: IncomingEvent,
    /// `false` when the provider event id was already on file and the existing
    /// record was returned instead.
    pub created: bool,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a new record, or return the existing one when
    /// `(source_type, provider_event_id)` is already known.
    async fn record(&self, event: NewIncomingEvent) -> Result<Recorded, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<IncomingEvent>, StoreError>;

    /// Move a `Pending` record to a terminal state. Returns `false` when the
    /// record was not pending (already finished by another delivery).
    async fn finish(
        &self,
        id: Uuid,
        state: ProcessingState,
        error: Option<String>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<Tenant>, StoreError>;

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Tenant>, StoreError>;

    /// Write billing fields if the stored version still equals `tenant.version`.
    /// Returns the tenant with its new version, or `StoreError::Conflict`.
    async fn update(&self, tenant: &Tenant) -> Result<Tenant, StoreError>;
}

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn find_by_identifier(
        &self,
        identifier: &str,
        platform: PlatformType,
    ) -> Result<Option<Integration>, StoreError>;
}

/// Bound a store call so a stalled connection surfaces as a timeout.
pub async fn with_timeout<T, F>(budget: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(budget.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let value = with_timeout(Duration::from_millis(50), async { Ok::<_, StoreError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_with_timeout_reports_stall() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(10))));
    }
}
