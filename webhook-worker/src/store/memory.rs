//! In-process store backed by hash maps.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EventStore, IntegrationStore, Recorded, TenantStore};
use crate::error::StoreError;
use crate::model::{
    IncomingEvent, Integration, NewIncomingEvent, PlatformType, ProcessingState, SourceType,
    Tenant,
};

#[derive(Default)]
struct Tables {
    events: HashMap<Uuid, IncomingEvent>,
    provider_ids: HashMap<(SourceType, String), Uuid>,
    tenants: HashMap<String, Tenant>,
    integrations: Vec<Integration>,
    tenant_writes: usize,
}

/// Shared in-memory store. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_tenant(&self, tenant: Tenant) {
        let mut tables = self.inner.write().await;
        tables.tenants.insert(tenant.id.clone(), tenant);
    }

    pub async fn insert_integration(&self, integration: Integration) {
        self.inner.write().await.integrations.push(integration);
    }

    pub async fn tenant(&self, id: &str) -> Option<Tenant> {
        self.inner.read().await.tenants.get(id).cloned()
    }

    pub async fn events(&self) -> Vec<IncomingEvent> {
        let mut events: Vec<_> = self.inner.read().await.events.values().cloned().collect();
        events.sort_by_key(|e| e.received_at);
        events
    }

    /// Number of successful tenant updates since creation.
    pub async fn tenant_writes(&self) -> usize {
        self.inner.read().await.tenant_writes
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn record(&self, event: NewIncomingEvent) -> Result<Recorded, StoreError> {
        let mut tables = self.inner.write().await;

        if let Some(provider_id) = &event.provider_event_id {
            let key = (event.source_type, provider_id.clone());
            if let Some(existing) = tables
                .provider_ids
                .get(&key)
                .and_then(|id| tables.events.get(id))
            {
                return Ok(Recorded {
                    event: existing.clone(),
                    created: false,
                });
            }
        }

        let record = event.into_event(Utc::now());
        if let Some(provider_id) = &record.provider_event_id {
            tables
                .provider_ids
                .insert((record.source_type, provider_id.clone()), record.id);
        }
        tables.events.insert(record.id, record.clone());

        Ok(Recorded {
            event: record,
            created: true,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<IncomingEvent>, StoreError> {
        Ok(self.inner.read().await.events.get(&id).cloned())
    }

    async fn finish(
        &self,
        id: Uuid,
        state: ProcessingState,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.inner.write().await;
        match tables.events.get_mut(&id) {
            Some(event) if event.processing_state == ProcessingState::Pending => {
                event.processing_state = state;
                event.error = error;
                event.processed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn find(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self.inner.read().await.tenants.get(id).cloned())
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Tenant>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .tenants
            .values()
            .find(|t| t.billing_subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn update(&self, tenant: &Tenant) -> Result<Tenant, StoreError> {
        let mut tables = self.inner.write().await;

        if let Some(sub) = &tenant.billing_subscription_id {
            let taken = tables
                .tenants
                .values()
                .any(|t| t.id != tenant.id && t.billing_subscription_id.as_ref() == Some(sub));
            if taken {
                return Err(StoreError::Duplicate {
                    entity: "subscription",
                    detail: format!("{sub} already assigned to another tenant"),
                });
            }
        }

        let stored = tables
            .tenants
            .get_mut(&tenant.id)
            .ok_or_else(|| StoreError::Unavailable(format!("tenant {} not found", tenant.id)))?;

        if stored.version != tenant.version {
            return Err(StoreError::Conflict {
                entity: "tenant",
                id: tenant.id.clone(),
            });
        }

        let mut updated = tenant.clone();
        updated.version += 1;
        *stored = updated.clone();
        tables.tenant_writes += 1;

        Ok(updated)
    }
}

#[async_trait]
impl IntegrationStore for MemoryStore {
    async fn find_by_identifier(
        &self,
        identifier: &str,
        platform: PlatformType,
    ) -> Result<Option<Integration>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .integrations
            .iter()
            .find(|i| i.platform_type == platform && i.external_identifier == identifier)
            .cloned())
    }
}
