//! Billing provider integration: event shapes and subscription lookups.

pub mod events;
pub mod stripe;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ProcessError;

pub use events::{
    BillingEvent, CheckoutSession, Invoice, BILLING_REASON_CYCLE, CHECKOUT_SESSION_COMPLETED,
    INVOICE_PAYMENT_SUCCEEDED,
};
pub use stripe::StripeClient;

/// The subscription facts the processor needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub product_id: String,
    pub current_period_end: DateTime<Utc>,
}

/// Read access to the billing provider's subscriptions.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Fetch a subscription. Unknown ids are data-integrity failures;
    /// network trouble is transient.
    async fn retrieve_subscription(&self, id: &str) -> Result<Subscription, ProcessError>;
}
