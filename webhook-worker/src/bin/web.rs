//! Hookline Web Server - webhook receiver.
//!
//! This binary provides a thin web server that:
//! - Receives webhooks from GitHub and Stripe
//! - Verifies signatures and resolves the tenant
//! - Records the raw event and enqueues a reference to RabbitMQ
//! - Responds as soon as the reference is confirmed
//!
//! All tenant mutations happen in the background processor.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hookline::verify::{BillingVerifier, SourceControlVerifier};
use hookline::web::router;
use hookline::{AppState, Config, Ingestor, PgStore, Publisher, WebhookRecorder};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        stripe_signing_configured = config.stripe_webhook_signing_secret.is_some(),
        github_signing_enforced = config.github_webhook_secret.is_some(),
        "config_loaded"
    );

    if config.stripe_webhook_signing_secret.is_none() {
        warn!("stripe_signing_secret_missing");
    }

    let store = PgStore::connect(
        &config.database_url,
        config.database_max_connections,
        config.store_timeout(),
    )
    .await
    .context("Failed to connect to Postgres")?;
    let shared = Arc::new(store.clone());

    // Create RabbitMQ publisher
    let publisher = Publisher::new(
        config.amqp_url.clone(),
        config.max_delivery_attempts,
        config.store_timeout(),
    );
    info!("rabbitmq_publisher_created");

    let ingestor = Ingestor::new(
        shared.clone(),
        shared.clone(),
        WebhookRecorder::new(shared, config.store_timeout()),
        Arc::new(publisher.clone()),
        SourceControlVerifier::new(config.github_webhook_secret.clone()),
        BillingVerifier::new(
            config.stripe_webhook_signing_secret.clone(),
            config.stripe_signature_tolerance_secs,
        ),
        config.store_timeout(),
    );

    let app = router(AppState::new(ingestor));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    publisher.close().await;
    store.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "sigint_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
