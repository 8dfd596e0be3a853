//! Postgres-backed store.
//!
//! Column layout is described in `sql/schema.sql`. Queries are plain runtime
//! statements so the crate builds without a live database.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::{EventStore, IntegrationStore, Recorded, TenantStore};
use crate::error::StoreError;
use crate::model::{
    IncomingEvent, Integration, NewIncomingEvent, Plan, PlatformType, ProcessingState,
    SourceType, Tenant,
};

const EVENT_COLUMNS: &str = "id, tenant_id, integration_id, type, event_kind, provider_event_id, \
     payload, processing_state, error, received_at, processed_at";

const TENANT_COLUMNS: &str = "id, plan, is_trial_plan, trial_ends_at, billing_subscription_id, \
     plan_subscription_ends_at, plan_updated_at, version";

/// Store backed by a shared connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool. `acquire_timeout` bounds how long a call waits for a
    /// free connection.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        info!(max_connections = max_connections, "postgres_pool_connected");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("postgres_pool_closed");
    }
}

fn parse_column<T: FromStr<Err = String>>(row: &PgRow, column: &str) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(StoreError::Unavailable)
}

fn event_from_row(row: &PgRow) -> Result<IncomingEvent, StoreError> {
    Ok(IncomingEvent {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        integration_id: row.try_get("integration_id")?,
        source_type: parse_column::<SourceType>(row, "type")?,
        event_kind: row.try_get("event_kind")?,
        provider_event_id: row.try_get("provider_event_id")?,
        received_at: row.try_get("received_at")?,
        raw_payload: row.try_get("payload")?,
        processing_state: parse_column::<ProcessingState>(row, "processing_state")?,
        error: row.try_get("error")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant, StoreError> {
    Ok(Tenant {
        id: row.try_get("id")?,
        plan: parse_column::<Plan>(row, "plan")?,
        is_trial_plan: row.try_get("is_trial_plan")?,
        trial_ends_at: row.try_get("trial_ends_at")?,
        billing_subscription_id: row.try_get("billing_subscription_id")?,
        plan_subscription_ends_at: row.try_get("plan_subscription_ends_at")?,
        plan_updated_at: row.try_get("plan_updated_at")?,
        version: row.try_get("version")?,
    })
}

#[async_trait]
impl EventStore for PgStore {
    async fn record(&self, event: NewIncomingEvent) -> Result<Recorded, StoreError> {
        let record = event.into_event(Utc::now());

        let inserted = sqlx::query(
            r#"
            INSERT INTO incoming_webhooks
                (id, tenant_id, integration_id, type, event_kind, provider_event_id,
                 payload, processing_state, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (type, provider_event_id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.tenant_id)
        .bind(&record.integration_id)
        .bind(record.source_type.as_str())
        .bind(&record.event_kind)
        .bind(&record.provider_event_id)
        .bind(&record.raw_payload)
        .bind(record.processing_state.as_str())
        .bind(record.received_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(Recorded {
                event: record,
                created: true,
            });
        }

        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM incoming_webhooks WHERE type = $1 AND provider_event_id = $2"
        ))
        .bind(record.source_type.as_str())
        .bind(&record.provider_event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Recorded {
            event: event_from_row(&row)?,
            created: false,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<IncomingEvent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM incoming_webhooks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn finish(
        &self,
        id: Uuid,
        state: ProcessingState,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE incoming_webhooks
            SET processing_state = $2, error = $3, processed_at = NOW()
            WHERE id = $1 AND processing_state = 'pending'
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }
}

#[async_trait]
impl TenantStore for PgStore {
    async fn find(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE billing_subscription_id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn update(&self, tenant: &Tenant) -> Result<Tenant, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tenants
            SET plan = $2,
                is_trial_plan = $3,
                trial_ends_at = $4,
                billing_subscription_id = $5,
                plan_subscription_ends_at = $6,
                plan_updated_at = $7,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $8
            RETURNING {TENANT_COLUMNS}
            "#
        ))
        .bind(&tenant.id)
        .bind(tenant.plan.as_str())
        .bind(tenant.is_trial_plan)
        .bind(tenant.trial_ends_at)
        .bind(&tenant.billing_subscription_id)
        .bind(tenant.plan_subscription_ends_at)
        .bind(tenant.plan_updated_at)
        .bind(tenant.version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => tenant_from_row(&row),
            None => Err(StoreError::Conflict {
                entity: "tenant",
                id: tenant.id.clone(),
            }),
        }
    }
}

#[async_trait]
impl IntegrationStore for PgStore {
    async fn find_by_identifier(
        &self,
        identifier: &str,
        platform: PlatformType,
    ) -> Result<Option<Integration>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, external_identifier
            FROM integrations
            WHERE external_identifier = $1 AND platform = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(identifier)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok::<_, StoreError>(Integration {
                id: row.try_get("id")?,
                tenant_id: row.try_get("tenant_id")?,
                platform_type: platform,
                external_identifier: row.try_get("external_identifier")?,
            })
        })
        .transpose()
    }
}
