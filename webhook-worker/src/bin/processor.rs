//! Hookline Processor - webhook event worker.
//!
//! This binary:
//! 1. Consumes event references from the hookline.webhooks queue
//! 2. Loads the recorded event and applies it to tenant billing state
//! 3. Forwards source-control events and publishes client notifications
//!
//! Failed deliveries are retried by the broker up to the configured
//! delivery limit, then dead-lettered.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hookline::worker::{run_consumer, ConsumerSettings};
use hookline::{Config, PgStore, PlanCatalog, Publisher, StripeClient, WebhookProcessor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("processor_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        concurrency = config.worker_concurrency,
        max_delivery_attempts = config.max_delivery_attempts,
        notify_delay_ms = config.notify_delay_ms,
        "config_loaded"
    );

    run(config).await
}

/// Run the processor.
async fn run(config: Config) -> Result<()> {
    let plans = PlanCatalog::from_config(&config);
    if plans.is_empty() {
        warn!("plan_catalog_empty");
    }
    info!(products = plans.len(), "plan_catalog_loaded");

    let secret_key = config
        .stripe_secret_key
        .clone()
        .context("STRIPE_SECRET_KEY must be set")?;
    let stripe = StripeClient::new(
        config.stripe_api_base.clone(),
        secret_key,
        config.request_timeout(),
    )
    .context("Failed to build Stripe client")?;

    let store = PgStore::connect(
        &config.database_url,
        config.database_max_connections,
        config.store_timeout(),
    )
    .await
    .context("Failed to connect to Postgres")?;
    let shared = Arc::new(store.clone());

    // Outbound: integration sync hand-off and pub/sub notifications
    let publisher = Publisher::new(
        config.amqp_url.clone(),
        config.max_delivery_attempts,
        config.store_timeout(),
    );
    let publisher_arc = Arc::new(publisher.clone());

    let processor = WebhookProcessor::new(
        shared.clone(),
        shared,
        Arc::new(stripe),
        publisher_arc.clone(),
        publisher_arc,
        plans,
    )
    .with_notify_delay(config.notify_delay())
    .with_store_timeout(config.store_timeout());

    let result = run_consumer(
        ConsumerSettings::from_config(&config),
        Arc::new(processor),
        shutdown_signal(),
    )
    .await;

    publisher.close().await;
    store.close().await;

    info!("processor_shutdown_complete");
    result
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
}
