//! Applies recorded webhook events to tenant state.
//!
//! Every outcome is one of three broker actions:
//! - `Ack`: done, including events that failed for good (marked `failed`)
//! - `Retry`: transient trouble, the event stays `pending` and is redelivered
//! - `Reject`: the message itself is unusable and goes to the dead letters

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::tenant_lock::TenantLocks;
use super::IntegrationSync;
use crate::billing::{
    BillingEvent, BillingProvider, BILLING_REASON_CYCLE, CHECKOUT_SESSION_COMPLETED,
    INVOICE_PAYMENT_SUCCEEDED,
};
use crate::error::{ProcessError, StoreError};
use crate::model::{IncomingEvent, Plan, ProcessingState, SourceType, Tenant};
use crate::notify::{NotificationMessage, Notifier};
use crate::plans::PlanCatalog;
use crate::queue::QueueMessage;
use crate::store::{with_timeout, EventStore, TenantStore};

/// Tracing target for events an operator has to act on.
pub const ALERT_TARGET: &str = "hookline::alert";

/// Fresh read-modify-write attempts before a version conflict is reported
/// as transient.
pub const MAX_CONFLICT_RETRIES: usize = 3;

/// Broker action for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Retry,
    Reject,
}

#[derive(Debug, Clone, Copy)]
enum TenantKey<'a> {
    Id(&'a str),
    Subscription(&'a str),
}

/// Processes event references taken off the work queue.
#[derive(Clone)]
pub struct WebhookProcessor {
    events: Arc<dyn EventStore>,
    tenants: Arc<dyn TenantStore>,
    billing: Arc<dyn BillingProvider>,
    notifier: Arc<dyn Notifier>,
    sync: Arc<dyn IntegrationSync>,
    plans: PlanCatalog,
    notify_delay: Duration,
    store_timeout: Duration,
    locks: TenantLocks,
}

impl WebhookProcessor {
    pub fn new(
        events: Arc<dyn EventStore>,
        tenants: Arc<dyn TenantStore>,
        billing: Arc<dyn BillingProvider>,
        notifier: Arc<dyn Notifier>,
        sync: Arc<dyn IntegrationSync>,
        plans: PlanCatalog,
    ) -> Self {
        Self {
            events,
            tenants,
            billing,
            notifier,
            sync,
            plans,
            notify_delay: Duration::from_secs(3),
            store_timeout: Duration::from_secs(5),
            locks: TenantLocks::new(),
        }
    }

    /// Delay between a tenant mutation and its client notification.
    pub fn with_notify_delay(mut self, delay: Duration) -> Self {
        self.notify_delay = delay;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Process one queued reference.
    pub async fn process(&self, message: &QueueMessage) -> Outcome {
        let guard = self.locks.acquire(&message.ordering_key()).await;

        let event = match with_timeout(self.store_timeout, self.events.get(message.event_id)).await
        {
            Ok(Some(event)) => event,
            Ok(None) => {
                error!(
                    target: ALERT_TARGET,
                    event_id = %message.event_id,
                    tenant_id = ?message.tenant_id,
                    "webhook_event_missing"
                );
                return Outcome::Ack;
            }
            Err(e) => {
                warn!(event_id = %message.event_id, error = %e, "webhook_event_load_failed");
                return Outcome::Retry;
            }
        };

        if event.processing_state.is_terminal() {
            info!(
                event_id = %event.id,
                processing_state = event.processing_state.as_str(),
                "webhook_already_processed"
            );
            return Outcome::Ack;
        }

        let result = self.apply(&event).await;
        let outcome = self.settle(&event, result).await;
        drop(guard);

        match outcome {
            Settled::Done(Some(notification)) => {
                self.notify(&notification).await;
                Outcome::Ack
            }
            Settled::Done(None) => Outcome::Ack,
            Settled::Retry => Outcome::Retry,
        }
    }

    async fn settle(
        &self,
        event: &IncomingEvent,
        result: Result<Option<NotificationMessage>, ProcessError>,
    ) -> Settled {
        let (state, error_text, notification) = match result {
            Ok(notification) => (ProcessingState::Processed, None, notification),
            Err(ProcessError::DataIntegrity(reason)) => {
                error!(
                    target: ALERT_TARGET,
                    event_id = %event.id,
                    tenant_id = ?event.tenant_id,
                    event_kind = ?event.event_kind,
                    error = %reason,
                    "webhook_data_integrity_failure"
                );
                (ProcessingState::Failed, Some(reason), None)
            }
            Err(ProcessError::Transient(reason)) => {
                warn!(
                    event_id = %event.id,
                    tenant_id = ?event.tenant_id,
                    error = %reason,
                    "webhook_process_retry"
                );
                return Settled::Retry;
            }
        };

        match with_timeout(
            self.store_timeout,
            self.events.finish(event.id, state, error_text),
        )
        .await
        {
            Ok(true) => {
                info!(
                    event_id = %event.id,
                    tenant_id = ?event.tenant_id,
                    processing_state = state.as_str(),
                    "webhook_processed"
                );
                Settled::Done(notification)
            }
            Ok(false) => {
                info!(event_id = %event.id, "webhook_finished_elsewhere");
                Settled::Done(None)
            }
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "webhook_finish_failed");
                Settled::Retry
            }
        }
    }

    async fn apply(
        &self,
        event: &IncomingEvent,
    ) -> Result<Option<NotificationMessage>, ProcessError> {
        match event.source_type {
            SourceType::SourceControl => {
                self.sync.forward(event).await?;
                info!(
                    event_id = %event.id,
                    integration_id = ?event.integration_id,
                    "integration_sync_forwarded"
                );
                Ok(None)
            }
            SourceType::Billing => {
                let billing: BillingEvent = serde_json::from_value(event.raw_payload.clone())
                    .map_err(|e| {
                        ProcessError::DataIntegrity(format!("undecodable billing event: {e}"))
                    })?;

                match billing.kind.as_str() {
                    CHECKOUT_SESSION_COMPLETED => self.checkout_completed(&billing).await,
                    INVOICE_PAYMENT_SUCCEEDED => {
                        self.invoice_paid(&billing).await?;
                        Ok(None)
                    }
                    other => {
                        info!(event_id = %event.id, event_kind = other, "billing_event_ignored");
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn checkout_completed(
        &self,
        event: &BillingEvent,
    ) -> Result<Option<NotificationMessage>, ProcessError> {
        let session = event
            .checkout_session()
            .map_err(|e| ProcessError::DataIntegrity(format!("malformed checkout session: {e}")))?;

        let tenant_id = session
            .client_reference_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ProcessError::DataIntegrity("checkout session has no client_reference_id".into())
            })?;
        let subscription_id = session.subscription.ok_or_else(|| {
            ProcessError::DataIntegrity("checkout session has no subscription".into())
        })?;

        // Resolve the plan before any tenant state is read or written.
        let subscription = self.billing.retrieve_subscription(&subscription_id).await?;
        let plan = self.plans.plan_for(&subscription.product_id).ok_or_else(|| {
            ProcessError::DataIntegrity(format!(
                "product {} is not mapped to a plan",
                subscription.product_id
            ))
        })?;

        let owner = with_timeout(
            self.store_timeout,
            self.tenants.find_by_subscription(&subscription_id),
        )
        .await?;
        if let Some(owner) = owner.filter(|t| t.id != tenant_id) {
            return Err(ProcessError::DataIntegrity(format!(
                "subscription {subscription_id} already belongs to tenant {}",
                owner.id
            )));
        }

        let event_time = event.created_at();
        let period_end = subscription.current_period_end;

        let tenant = self
            .mutate_tenant(TenantKey::Id(&tenant_id), |tenant| {
                apply_checkout(tenant, plan, &subscription_id, period_end, event_time)
            })
            .await?;

        let applied = tenant.plan == plan
            && tenant.billing_subscription_id.as_deref() == Some(subscription_id.as_str());

        if !applied {
            info!(
                tenant_id = %tenant.id,
                subscription_id = %subscription_id,
                "checkout_superseded"
            );
            return Ok(None);
        }

        info!(
            tenant_id = %tenant.id,
            plan = %plan,
            subscription_id = %subscription_id,
            plan_subscription_ends_at = ?tenant.plan_subscription_ends_at,
            "checkout_completed"
        );

        Ok(Some(NotificationMessage::plan_upgraded(
            &tenant.id,
            plan,
            &subscription_id,
        )))
    }

    async fn invoice_paid(&self, event: &BillingEvent) -> Result<(), ProcessError> {
        let invoice = event
            .invoice()
            .map_err(|e| ProcessError::DataIntegrity(format!("malformed invoice: {e}")))?;

        if invoice.billing_reason.as_deref() != Some(BILLING_REASON_CYCLE) {
            info!(
                billing_reason = ?invoice.billing_reason,
                "invoice_ignored"
            );
            return Ok(());
        }

        let subscription_id = invoice.subscription.ok_or_else(|| {
            ProcessError::DataIntegrity("renewal invoice has no subscription".into())
        })?;

        // Fail fast on unknown subscriptions before calling the provider.
        self.load_tenant(TenantKey::Subscription(&subscription_id))
            .await?;

        let subscription = self.billing.retrieve_subscription(&subscription_id).await?;
        let period_end = subscription.current_period_end;

        let tenant = self
            .mutate_tenant(TenantKey::Subscription(&subscription_id), |tenant| {
                extend_period(tenant, period_end);
            })
            .await?;

        info!(
            tenant_id = %tenant.id,
            subscription_id = %subscription_id,
            plan_subscription_ends_at = ?tenant.plan_subscription_ends_at,
            "subscription_renewed"
        );

        Ok(())
    }

    async fn load_tenant(&self, key: TenantKey<'_>) -> Result<Tenant, ProcessError> {
        let found = match key {
            TenantKey::Id(id) => with_timeout(self.store_timeout, self.tenants.find(id)).await?,
            TenantKey::Subscription(sub) => {
                with_timeout(self.store_timeout, self.tenants.find_by_subscription(sub)).await?
            }
        };

        found.ok_or_else(|| match key {
            TenantKey::Id(id) => ProcessError::DataIntegrity(format!("tenant {id} not found")),
            TenantKey::Subscription(sub) => {
                ProcessError::DataIntegrity(format!("no tenant holds subscription {sub}"))
            }
        })
    }

    /// Read-modify-write with a version check. Unchanged tenants are not
    /// written.
    async fn mutate_tenant<F>(
        &self,
        key: TenantKey<'_>,
        mut change: F,
    ) -> Result<Tenant, ProcessError>
    where
        F: FnMut(&mut Tenant),
    {
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let current = self.load_tenant(key).await?;
            let mut next = current.clone();
            change(&mut next);

            if next == current {
                return Ok(current);
            }

            match with_timeout(self.store_timeout, self.tenants.update(&next)).await {
                Ok(updated) => return Ok(updated),
                Err(StoreError::Conflict { id, .. }) => {
                    warn!(tenant_id = %id, attempt, "tenant_version_conflict");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ProcessError::Transient(format!(
            "tenant kept changing after {MAX_CONFLICT_RETRIES} attempts"
        )))
    }

    async fn notify(&self, message: &NotificationMessage) {
        if !self.notify_delay.is_zero() {
            tokio::time::sleep(self.notify_delay).await;
        }

        match self.notifier.publish(message).await {
            Ok(()) => info!(
                channel = %message.channel,
                event_name = %message.event_name,
                tenant_scope = ?message.tenant_scope,
                "notification_published"
            ),
            Err(e) => warn!(
                channel = %message.channel,
                event_name = %message.event_name,
                error = %e,
                "notification_publish_failed"
            ),
        }
    }
}

enum Settled {
    Done(Option<NotificationMessage>),
    Retry,
}

/// Plan changes only apply when the event is at least as new as the last
/// applied plan change. The paid-through date never moves backwards for the
/// same subscription.
fn apply_checkout(
    tenant: &mut Tenant,
    plan: Plan,
    subscription_id: &str,
    period_end: DateTime<Utc>,
    event_time: DateTime<Utc>,
) {
    let same_subscription = tenant.billing_subscription_id.as_deref() == Some(subscription_id);
    let current = tenant.plan_updated_at.map_or(true, |at| event_time >= at);

    if current {
        tenant.plan = plan;
        tenant.is_trial_plan = false;
        tenant.trial_ends_at = None;
        tenant.plan_updated_at = Some(event_time);
        if !same_subscription {
            tenant.billing_subscription_id = Some(subscription_id.to_string());
            tenant.plan_subscription_ends_at = Some(period_end);
            return;
        }
    }

    if same_subscription {
        extend_period(tenant, period_end);
    }
}

fn extend_period(tenant: &mut Tenant, period_end: DateTime<Utc>) {
    tenant.plan_subscription_ends_at = Some(match tenant.plan_subscription_ends_at {
        Some(existing) => existing.max(period_end),
        None => period_end,
    });
}
