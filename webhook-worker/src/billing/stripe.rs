//! Minimal Stripe REST client.
//!
//! Only `GET /v1/subscriptions/{id}` is used. The client is built once at
//! startup and shared; every request carries the configured timeout.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{error, info, warn};

use super::events::unix_to_utc;
use super::{BillingProvider, Subscription};
use crate::error::ProcessError;

/// Stripe API client.
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    api_base: String,
    secret_key: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    id: String,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    plan: Option<PlanRef>,
    #[serde(default)]
    items: Option<ItemList>,
}

#[derive(Debug, Deserialize)]
struct PlanRef {
    product: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemList {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    price: Option<PlanRef>,
    #[serde(default)]
    plan: Option<PlanRef>,
}

impl SubscriptionResponse {
    /// Newer API versions move the product and period end onto the items.
    fn into_subscription(self) -> Result<Subscription, ProcessError> {
        let first_item = self.items.as_ref().and_then(|i| i.data.first());

        let product_id = self
            .plan
            .as_ref()
            .and_then(|p| p.product.clone())
            .or_else(|| {
                first_item.and_then(|item| {
                    item.price
                        .as_ref()
                        .or(item.plan.as_ref())
                        .and_then(|p| p.product.clone())
                })
            })
            .ok_or_else(|| {
                ProcessError::DataIntegrity(format!("subscription {} has no product", self.id))
            })?;

        let period_end = self
            .current_period_end
            .or_else(|| first_item.and_then(|item| item.current_period_end))
            .ok_or_else(|| {
                ProcessError::DataIntegrity(format!("subscription {} has no period end", self.id))
            })?;

        Ok(Subscription {
            id: self.id,
            product_id,
            current_period_end: unix_to_utc(period_end),
        })
    }
}

impl StripeClient {
    pub fn new(
        api_base: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(16)
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            timeout,
        })
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn retrieve_subscription(&self, id: &str) -> Result<Subscription, ProcessError> {
        if !is_valid_object_id(id) {
            warn!(subscription_id = %id, "stripe_subscription_id_invalid");
            return Err(ProcessError::DataIntegrity(format!(
                "invalid subscription id {id:?}"
            )));
        }

        let url = format!("{}/v1/subscriptions/{}", self.api_base, id);

        info!(subscription_id = %id, "stripe_subscription_fetch_starting");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.secret_key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!(
                        subscription_id = %id,
                        timeout_seconds = self.timeout.as_secs_f64(),
                        "stripe_subscription_fetch_timeout"
                    );
                } else {
                    error!(subscription_id = %id, error = %e, "stripe_subscription_fetch_error");
                }
                ProcessError::Transient(format!("subscription fetch failed: {e}"))
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            warn!(subscription_id = %id, "stripe_subscription_not_found");
            return Err(ProcessError::DataIntegrity(format!(
                "subscription {id} not found at billing provider"
            )));
        }
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
        {
            warn!(subscription_id = %id, status_code = status.as_u16(), "stripe_subscription_fetch_retryable");
            return Err(ProcessError::Transient(format!(
                "billing provider returned {status}"
            )));
        }
        if !status.is_success() {
            warn!(subscription_id = %id, status_code = status.as_u16(), "stripe_subscription_fetch_rejected");
            return Err(ProcessError::DataIntegrity(format!(
                "billing provider rejected subscription {id}: {status}"
            )));
        }

        let body: SubscriptionResponse = response
            .json()
            .await
            .map_err(|e| ProcessError::Transient(format!("subscription body unreadable: {e}")))?;

        let subscription = body.into_subscription()?;

        info!(
            subscription_id = %subscription.id,
            product_id = %subscription.product_id,
            current_period_end = %subscription.current_period_end,
            "stripe_subscription_fetched"
        );

        Ok(subscription)
    }
}

/// Stripe object ids are `[A-Za-z0-9_]` only; anything else would change
/// the request path.
fn is_valid_object_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
