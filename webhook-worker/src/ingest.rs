//! Ingestion path: Verify → Record → Enqueue.
//!
//! Each call does a bounded amount of synchronous work and returns, so the
//! provider gets its answer regardless of how long processing takes.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::billing::BillingEvent;
use crate::error::{IngestError, VerifyError};
use crate::model::{NewIncomingEvent, SourceType};
use crate::queue::{Dispatcher, QueueMessage};
use crate::record::{source_control_payload, WebhookRecorder};
use crate::store::{with_timeout, IntegrationStore, Recorded, TenantStore};
use crate::verify::{BillingVerifier, SourceControlVerifier, STRIPE_SIGNATURE_HEADER};

/// What happened to an inbound webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Recorded, and enqueued unless the record had already finished.
    Accepted { event_id: Uuid, enqueued: bool },
    /// No tenant identity matched; dropped without a record.
    Ignored,
}

/// Everything the receiver needs, built once at startup.
#[derive(Clone)]
pub struct Ingestor {
    integrations: Arc<dyn IntegrationStore>,
    tenants: Arc<dyn TenantStore>,
    recorder: WebhookRecorder,
    dispatcher: Arc<dyn Dispatcher>,
    source_control: SourceControlVerifier,
    billing: BillingVerifier,
    timeout: Duration,
}

impl Ingestor {
    pub fn new(
        integrations: Arc<dyn IntegrationStore>,
        tenants: Arc<dyn TenantStore>,
        recorder: WebhookRecorder,
        dispatcher: Arc<dyn Dispatcher>,
        source_control: SourceControlVerifier,
        billing: BillingVerifier,
        timeout: Duration,
    ) -> Self {
        Self {
            integrations,
            tenants,
            recorder,
            dispatcher,
            source_control,
            billing,
            timeout,
        }
    }

    /// Ingest a GitHub delivery. Unknown installations are accepted and
    /// dropped so the provider does not retry them.
    pub async fn ingest_source_control(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        let delivery = self.source_control.parse(headers, body)?;

        let integration = match self
            .source_control
            .resolve(self.integrations.as_ref(), &delivery, self.timeout)
            .await
        {
            Ok(integration) => integration,
            Err(IngestError::Verification(VerifyError::UnknownIntegration(identifier))) => {
                error!(identifier = %identifier, "github_integration_not_found");
                return Ok(IngestOutcome::Ignored);
            }
            Err(e) => return Err(e),
        };

        info!(
            integration_id = %integration.id,
            event_kind = ?delivery.event_kind,
            "github_webhook_received"
        );

        let recorded = self
            .recorder
            .record(NewIncomingEvent {
                tenant_id: Some(integration.tenant_id.clone()),
                integration_id: Some(integration.id.clone()),
                source_type: SourceType::SourceControl,
                event_kind: delivery.event_kind.clone(),
                provider_event_id: delivery.delivery_id.clone(),
                raw_payload: source_control_payload(&delivery),
            })
            .await?;

        self.dispatch(recorded).await
    }

    /// Ingest a Stripe event. The signature is checked over the bytes as
    /// received, before anything is parsed or stored.
    pub async fn ingest_billing(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        let signature = headers
            .get(STRIPE_SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());

        let verified = self.billing.verify(signature, body)?;

        info!(
            provider_event_id = %verified.event.id,
            event_kind = %verified.event.kind,
            "stripe_webhook_verified"
        );

        let tenant_id = self.routing_tenant(&verified.event).await?;

        let recorded = self
            .recorder
            .record(NewIncomingEvent {
                tenant_id,
                integration_id: None,
                source_type: SourceType::Billing,
                event_kind: Some(verified.event.kind.clone()),
                provider_event_id: Some(verified.event.id.clone()),
                raw_payload: verified.raw,
            })
            .await?;

        self.dispatch(recorded).await
    }

    /// Tenant a billing event should be serialized under: the checkout
    /// reference when present, else the owner of the referenced subscription.
    async fn routing_tenant(&self, event: &BillingEvent) -> Result<Option<String>, IngestError> {
        if let Some(reference) = event.client_reference() {
            return Ok(Some(reference.to_string()));
        }

        let Some(subscription_id) = event.subscription_ref() else {
            return Ok(None);
        };

        let tenant = with_timeout(
            self.timeout,
            self.tenants.find_by_subscription(subscription_id),
        )
        .await?;

        Ok(tenant.map(|t| t.id))
    }

    async fn dispatch(&self, recorded: Recorded) -> Result<IngestOutcome, IngestError> {
        let event = recorded.event;

        if !recorded.created && event.processing_state.is_terminal() {
            info!(
                event_id = %event.id,
                processing_state = event.processing_state.as_str(),
                "webhook_duplicate_already_processed"
            );
            return Ok(IngestOutcome::Accepted {
                event_id: event.id,
                enqueued: false,
            });
        }

        let message = QueueMessage::new(event.tenant_id.clone(), event.id);

        if let Err(e) = self.dispatcher.enqueue(&message).await {
            // The record stays pending and can be re-driven.
            warn!(event_id = %event.id, error = %e, "webhook_enqueue_failed");
            return Err(e.into());
        }

        info!(
            event_id = %event.id,
            tenant_id = ?event.tenant_id,
            duplicate = !recorded.created,
            "webhook_enqueued"
        );

        Ok(IngestOutcome::Accepted {
            event_id: event.id,
            enqueued: true,
        })
    }
}
