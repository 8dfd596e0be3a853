//! Web server module for inbound provider webhooks.
//!
//! The receiver stays fast: verify, record, enqueue, respond. All tenant
//! mutations happen in the background processor.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{github_webhook, health, status_for, stripe_webhook, AppState, HealthResponse};

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/github", post(github_webhook))
        .route("/webhooks/stripe", post(stripe_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::ingest::Ingestor;
    use crate::model::{Integration, PlatformType, Tenant};
    use crate::record::WebhookRecorder;
    use crate::store::MemoryStore;
    use crate::test_support::RecordingQueue;
    use crate::verify::{
        sign_payload, BillingVerifier, SourceControlVerifier, GITHUB_EVENT_HEADER,
        STRIPE_SIGNATURE_HEADER,
    };

    const SECRET: &str = "whsec_router";

    async fn app() -> (Router, MemoryStore, RecordingQueue) {
        let store = MemoryStore::new();
        store.insert_tenant(Tenant::trial("t1", None)).await;
        store
            .insert_integration(Integration {
                id: "int_1".to_string(),
                tenant_id: "t1".to_string(),
                platform_type: PlatformType::Github,
                external_identifier: "4242".to_string(),
            })
            .await;

        let queue = RecordingQueue::default();
        let shared = Arc::new(store.clone());
        let ingestor = Ingestor::new(
            shared.clone(),
            shared.clone(),
            WebhookRecorder::new(shared, Duration::from_secs(1)),
            Arc::new(queue.clone()),
            SourceControlVerifier::new(None),
            BillingVerifier::new(Some(SECRET.to_string()), 300),
            Duration::from_secs(1),
        );

        (router(AppState::new(ingestor)), store, queue)
    }

    fn github_request(installation: u64) -> Request<Body> {
        let body = serde_json::json!({"installation": {"id": installation}}).to_string();
        Request::builder()
            .method("POST")
            .uri("/webhooks/github")
            .header(GITHUB_EVENT_HEADER, "push")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn stripe_request(body: &str, secret: &str) -> Request<Body> {
        let signature = sign_payload(secret, chrono::Utc::now().timestamp(), body.as_bytes());
        Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header(STRIPE_SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn checkout_body() -> String {
        serde_json::json!({
            "id": "evt_router",
            "type": "checkout.session.completed",
            "created": chrono::Utc::now().timestamp(),
            "data": {"object": {"client_reference_id": "t1", "subscription": "sub_1"}}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_github_known_installation_returns_no_content() {
        let (app, store, queue) = app().await;
        let response = app.oneshot(github_request(4242)).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(store.events().await.len(), 1);
        assert_eq!(queue.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_github_unknown_installation_is_accepted_and_dropped() {
        let (app, store, queue) = app().await;
        let response = app.oneshot(github_request(1)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.events().await.is_empty());
        assert!(queue.messages().is_empty());
    }

    #[tokio::test]
    async fn test_github_malformed_body_is_bad_request() {
        let (app, _, _) = app().await;
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/github")
            .body(Body::from("{\"zen\":"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stripe_valid_signature_is_recorded() {
        let (app, store, queue) = app().await;
        let response = app
            .oneshot(stripe_request(&checkout_body(), SECRET))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].provider_event_id.as_deref(), Some("evt_router"));
        assert_eq!(queue.messages()[0].tenant_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_stripe_invalid_signature_is_rejected() {
        let (app, store, queue) = app().await;
        let response = app
            .oneshot(stripe_request(&checkout_body(), "whsec_other"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.events().await.is_empty());
        assert!(queue.messages().is_empty());
    }

    #[tokio::test]
    async fn test_stripe_enqueue_failure_is_server_error() {
        let (app, store, queue) = app().await;
        queue.fail_next(true);

        let response = app
            .oneshot(stripe_request(&checkout_body(), SECRET))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(store.events().await.len(), 1);
    }
}
