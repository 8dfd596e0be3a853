//! The slice of Stripe's event shapes needed for dispatch.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";

/// Billing reason Stripe sets on invoices for renewal periods.
pub const BILLING_REASON_CYCLE: &str = "subscription_cycle";

/// Top-level Stripe event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix seconds when Stripe created the event.
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// `data.object` of a `checkout.session.completed` event.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
}

/// `data.object` of an `invoice.*` event.
#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
}

impl BillingEvent {
    pub fn created_at(&self) -> DateTime<Utc> {
        unix_to_utc(self.created)
    }

    pub fn checkout_session(&self) -> Result<CheckoutSession, serde_json::Error> {
        serde_json::from_value(self.data.object.clone())
    }

    pub fn invoice(&self) -> Result<Invoice, serde_json::Error> {
        serde_json::from_value(self.data.object.clone())
    }

    /// Subscription id referenced by the event object, whatever its kind.
    pub fn subscription_ref(&self) -> Option<&str> {
        self.data.object.get("subscription").and_then(|v| v.as_str())
    }

    /// `client_reference_id` carried by checkout sessions.
    pub fn client_reference(&self) -> Option<&str> {
        self.data
            .object
            .get("client_reference_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Convert Unix seconds, clamping out-of-range values to the epoch.
pub fn unix_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_default()
}
