//! Stripe webhook signature verification.
//!
//! Stripe signs the raw request body with HMAC-SHA256. The `Stripe-Signature`
//! header looks like `t=1700000000,v1=<hex>,v1=<hex>,v0=<hex>`; the signed
//! message is `"{t}.{body}"`. Only `v1` schemes are accepted.
//! Reference: https://docs.stripe.com/webhooks#verify-manually

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use super::signature::{constant_time_compare, hmac_sha256_hex, is_secret_configured};
use crate::billing::BillingEvent;
use crate::error::VerifyError;

/// Header carrying the Stripe signature.
pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

/// Verified billing event along with the JSON it was parsed from.
#[derive(Debug, Clone)]
pub struct VerifiedBillingEvent {
    pub event: BillingEvent,
    pub raw: serde_json::Value,
}

/// Verifies Stripe webhooks against a signing secret. Fails closed: with no
/// secret configured every request is rejected.
#[derive(Debug, Clone)]
pub struct BillingVerifier {
    signing_secret: Option<String>,
    tolerance_secs: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: i64,
    v1: Vec<String>,
}

impl BillingVerifier {
    pub fn new(signing_secret: Option<String>, tolerance_secs: u64) -> Self {
        Self {
            signing_secret,
            tolerance_secs,
        }
    }

    /// Verify against the current wall clock.
    pub fn verify(
        &self,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<VerifiedBillingEvent, VerifyError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.verify_at(signature_header, body, now)
    }

    /// Verify the signature over the raw body, then parse the event.
    pub fn verify_at(
        &self,
        signature_header: Option<&str>,
        body: &[u8],
        now: i64,
    ) -> Result<VerifiedBillingEvent, VerifyError> {
        if !is_secret_configured(&self.signing_secret) {
            warn!("stripe_signing_secret_not_configured");
            return Err(VerifyError::InvalidSignature(
                "signing secret not configured".to_string(),
            ));
        }
        let secret = self.signing_secret.as_deref().unwrap_or_default();

        let header = signature_header
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| VerifyError::InvalidSignature("missing signature header".to_string()))?;

        let parsed = parse_signature_header(header).ok_or_else(|| {
            warn!(header_length = header.len(), "stripe_signature_header_malformed");
            VerifyError::InvalidSignature("malformed signature header".to_string())
        })?;

        let age = (now - parsed.timestamp).unsigned_abs();
        if age > self.tolerance_secs {
            warn!(
                webhook_time = parsed.timestamp,
                current_time = now,
                age_seconds = age,
                max_age_seconds = self.tolerance_secs,
                "stripe_signature_stale"
            );
            return Err(VerifyError::InvalidSignature("timestamp outside tolerance".to_string()));
        }

        let mut signed_payload = format!("{}.", parsed.timestamp).into_bytes();
        signed_payload.extend_from_slice(body);

        let expected = hmac_sha256_hex(secret.as_bytes(), &signed_payload)
            .ok_or_else(|| VerifyError::InvalidSignature("unusable signing secret".to_string()))?;

        if !parsed
            .v1
            .iter()
            .any(|candidate| constant_time_compare(&expected, candidate))
        {
            warn!(candidates = parsed.v1.len(), "stripe_signature_mismatch");
            return Err(VerifyError::InvalidSignature("signature mismatch".to_string()));
        }

        let raw: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| VerifyError::MalformedPayload(e.to_string()))?;
        let event: BillingEvent = serde_json::from_value(raw.clone())
            .map_err(|e| VerifyError::MalformedPayload(e.to_string()))?;

        Ok(VerifiedBillingEvent { event, raw })
    }
}

fn parse_signature_header(header: &str) -> Option<SignatureHeader> {
    let mut timestamp = None;
    let mut v1 = Vec::new();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse::<i64>().ok(),
                "v1" if !value.is_empty() => v1.push(value.to_string()),
                _ => {}
            }
        }
    }

    match (timestamp, v1.is_empty()) {
        (Some(timestamp), false) => Some(SignatureHeader { timestamp, v1 }),
        _ => None,
    }
}

/// Build a `Stripe-Signature` header value for `body`. Used by tests and
/// local tooling that replays captured events.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut signed_payload = format!("{timestamp}.").into_bytes();
    signed_payload.extend_from_slice(body);
    let digest = hmac_sha256_hex(secret.as_bytes(), &signed_payload).unwrap_or_default();
    format!("t={timestamp},v1={digest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    fn body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": NOW,
            "data": {"object": {"client_reference_id": "t1", "subscription": "sub_1"}}
        }))
        .unwrap()
    }

    fn verifier() -> BillingVerifier {
        BillingVerifier::new(Some(SECRET.to_string()), 300)
    }

    #[test]
    fn test_valid_signature_parses_event() {
        let body = body();
        let header = sign_payload(SECRET, NOW, &body);

        let verified = verifier().verify_at(Some(&header), &body, NOW + 10).unwrap();
        assert_eq!(verified.event.id, "evt_1");
        assert_eq!(verified.event.kind, "checkout.session.completed");
        assert_eq!(verified.raw["data"]["object"]["subscription"], "sub_1");
    }

    #[test]
    fn test_tampered_body_rejected() {
        let body = body();
        let header = sign_payload(SECRET, NOW, &body);
        let mut tampered = body.clone();
        tampered.extend_from_slice(b" ");

        let err = verifier().verify_at(Some(&header), &tampered, NOW).unwrap_err();
        assert!(matches!(err, VerifyError::InvalidSignature(_)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = body();
        let header = sign_payload("whsec_other", NOW, &body);
        assert!(verifier().verify_at(Some(&header), &body, NOW).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let body = body();
        let header = sign_payload(SECRET, NOW - 301, &body);
        let err = verifier().verify_at(Some(&header), &body, NOW).unwrap_err();
        assert_eq!(
            err,
            VerifyError::InvalidSignature("timestamp outside tolerance".to_string())
        );
    }

    #[test]
    fn test_any_v1_candidate_may_match() {
        let body = body();
        let good = sign_payload(SECRET, NOW, &body);
        let digest = good.split("v1=").nth(1).unwrap();
        let header = format!("t={NOW},v1=deadbeef,v0=cafe,v1={digest}");

        assert!(verifier().verify_at(Some(&header), &body, NOW).is_ok());
    }

    #[test]
    fn test_missing_header_or_secret_fails_closed() {
        let body = body();
        assert!(verifier().verify_at(None, &body, NOW).is_err());
        assert!(verifier().verify_at(Some("  "), &body, NOW).is_err());

        let header = sign_payload(SECRET, NOW, &body);
        let unconfigured = BillingVerifier::new(None, 300);
        assert!(unconfigured.verify_at(Some(&header), &body, NOW).is_err());
    }

    #[test]
    fn test_signed_garbage_is_malformed() {
        let body = b"not json".to_vec();
        let header = sign_payload(SECRET, NOW, &body);
        let err = verifier().verify_at(Some(&header), &body, NOW).unwrap_err();
        assert!(matches!(err, VerifyError::MalformedPayload(_)));
    }

    #[test]
    fn test_parse_signature_header() {
        assert_eq!(
            parse_signature_header("t=12,v1=abc,v0=def"),
            Some(SignatureHeader {
                timestamp: 12,
                v1: vec!["abc".to_string()],
            })
        );
        assert_eq!(parse_signature_header("v1=abc"), None);
        assert_eq!(parse_signature_header("t=12"), None);
        assert_eq!(parse_signature_header("t=abc,v1=abc"), None);
    }
}
