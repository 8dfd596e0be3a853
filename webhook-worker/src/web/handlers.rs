//! Webhook endpoint handlers.
//!
//! These handlers are deliberately thin - they only:
//! 1. Verify the provider signature or identity
//! 2. Record the raw event
//! 3. Enqueue a reference and return
//!
//! Tenant mutations happen in the background processor.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{IngestError, VerifyError};
use crate::ingest::{IngestOutcome, Ingestor};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
}

impl AppState {
    pub fn new(ingestor: Ingestor) -> Self {
        Self {
            ingestor: Arc::new(ingestor),
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Status mapping
// =============================================================================

/// HTTP status for an ingestion failure.
///
/// Verification failures are final (400). Storage and broker trouble is 500
/// so the provider redelivers; the redelivery dedups onto the same record.
pub fn status_for(err: &IngestError) -> StatusCode {
    match err {
        IngestError::Verification(VerifyError::UnknownIntegration(_)) => StatusCode::OK,
        IngestError::Verification(_) => StatusCode::BAD_REQUEST,
        IngestError::Persistence(_) | IngestError::Enqueue(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn log_failure(source: &'static str, err: &IngestError) {
    match err {
        IngestError::Verification(e) => warn!(source = source, error = %e, "webhook_rejected"),
        IngestError::Persistence(e) => error!(source = source, error = %e, "webhook_persist_failed"),
        IngestError::Enqueue(e) => error!(source = source, error = %e, "webhook_enqueue_failed"),
    }
}

// =============================================================================
// GitHub Webhook
// =============================================================================

/// GitHub webhook endpoint.
///
/// `204` once recorded and enqueued, `200` when no integration matches the
/// installation (so GitHub stops retrying).
pub async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    info!(body_length = body.len(), "github_webhook_received");

    match state.ingestor.ingest_source_control(&headers, &body).await {
        Ok(IngestOutcome::Accepted { event_id, enqueued }) => {
            info!(event_id = %event_id, enqueued = enqueued, "github_webhook_accepted");
            StatusCode::NO_CONTENT
        }
        Ok(IngestOutcome::Ignored) => StatusCode::OK,
        Err(e) => {
            log_failure("github", &e);
            status_for(&e)
        }
    }
}

// =============================================================================
// Stripe Webhook
// =============================================================================

/// Stripe webhook endpoint. The body is taken as raw bytes since the
/// signature covers them exactly.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    info!(body_length = body.len(), "stripe_webhook_received");

    match state.ingestor.ingest_billing(&headers, &body).await {
        Ok(IngestOutcome::Accepted { event_id, enqueued }) => {
            info!(event_id = %event_id, enqueued = enqueued, "stripe_webhook_accepted");
            StatusCode::OK
        }
        Ok(IngestOutcome::Ignored) => StatusCode::OK,
        Err(e) => {
            log_failure("stripe", &e);
            status_for(&e)
        }
    }
}
