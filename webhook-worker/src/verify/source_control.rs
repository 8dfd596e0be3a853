//! GitHub webhook identity resolution.
//!
//! Events are attributed to a tenant through the `installation.id` in the
//! body. Signature headers are always parsed and kept with the record;
//! they are only enforced when a webhook secret is configured.

use std::time::Duration;

use axum::http::HeaderMap;
use tracing::{info, warn};

use super::signature::{constant_time_compare, hmac_sha256_hex, is_secret_configured};
use crate::error::{IngestError, VerifyError};
use crate::model::{Integration, PlatformType};
use crate::store::{with_timeout, IntegrationStore};

pub const GITHUB_SIGNATURE_256_HEADER: &str = "x-hub-signature-256";
pub const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature";
pub const GITHUB_EVENT_HEADER: &str = "x-github-event";
pub const GITHUB_DELIVERY_HEADER: &str = "x-github-delivery";

/// A parsed `<algorithm>=<hex digest>` signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSignature {
    pub algorithm: String,
    pub digest: String,
}

impl ProviderSignature {
    pub fn parse(raw: &str) -> Option<Self> {
        let (algorithm, digest) = raw.trim().split_once('=')?;
        if algorithm.is_empty() || digest.is_empty() {
            return None;
        }
        Some(Self {
            algorithm: algorithm.to_ascii_lowercase(),
            digest: digest.to_ascii_lowercase(),
        })
    }
}

/// A GitHub webhook with its dispatch-relevant fields pulled out.
#[derive(Debug, Clone)]
pub struct SourceControlDelivery {
    pub installation_id: String,
    pub event_kind: Option<String>,
    pub delivery_id: Option<String>,
    /// Raw signature header as received, preferring the SHA-256 variant.
    pub signature: Option<String>,
    pub data: serde_json::Value,
}

/// Parses GitHub deliveries and resolves them to integrations.
#[derive(Debug, Clone)]
pub struct SourceControlVerifier {
    secret: Option<String>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl SourceControlVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    pub fn enforces_signatures(&self) -> bool {
        is_secret_configured(&self.secret)
    }

    /// Parse the delivery and, when a secret is configured, check its
    /// `sha256` signature over the raw body.
    pub fn parse(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<SourceControlDelivery, VerifyError> {
        let signature = header(headers, GITHUB_SIGNATURE_256_HEADER)
            .or_else(|| header(headers, GITHUB_SIGNATURE_HEADER))
            .map(str::to_string);

        if self.enforces_signatures() {
            self.check_signature(signature.as_deref(), body)?;
        }

        let data: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| VerifyError::MalformedPayload(e.to_string()))?;

        let installation_id = match data.pointer("/installation/id") {
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            _ => {
                return Err(VerifyError::MalformedPayload(
                    "missing installation.id".to_string(),
                ))
            }
        };

        Ok(SourceControlDelivery {
            installation_id,
            event_kind: header(headers, GITHUB_EVENT_HEADER).map(str::to_string),
            delivery_id: header(headers, GITHUB_DELIVERY_HEADER).map(str::to_string),
            signature,
            data,
        })
    }

    fn check_signature(&self, signature: Option<&str>, body: &[u8]) -> Result<(), VerifyError> {
        let secret = self.secret.as_deref().unwrap_or_default();

        let parsed = signature.and_then(ProviderSignature::parse).ok_or_else(|| {
            warn!("github_signature_missing");
            VerifyError::InvalidSignature("missing signature header".to_string())
        })?;

        if parsed.algorithm != "sha256" {
            warn!(algorithm = %parsed.algorithm, "github_signature_unsupported_algorithm");
            return Err(VerifyError::InvalidSignature(format!(
                "unsupported algorithm {}",
                parsed.algorithm
            )));
        }

        let expected = hmac_sha256_hex(secret.as_bytes(), body)
            .ok_or_else(|| VerifyError::InvalidSignature("unusable secret".to_string()))?;

        if !constant_time_compare(&expected, &parsed.digest) {
            warn!("github_signature_mismatch");
            return Err(VerifyError::InvalidSignature("signature mismatch".to_string()));
        }

        Ok(())
    }

    /// Resolve the delivery's installation to a known integration.
    pub async fn resolve(
        &self,
        integrations: &dyn IntegrationStore,
        delivery: &SourceControlDelivery,
        budget: Duration,
    ) -> Result<Integration, IngestError> {
        let found = with_timeout(
            budget,
            integrations.find_by_identifier(&delivery.installation_id, PlatformType::Github),
        )
        .await?;

        match found {
            Some(integration) => {
                info!(
                    integration_id = %integration.id,
                    tenant_id = %integration.tenant_id,
                    "github_integration_resolved"
                );
                Ok(integration)
            }
            None => Err(VerifyError::UnknownIntegration(delivery.installation_id.clone()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn push_body(installation: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "ref": "refs/heads/main",
            "installation": {"id": installation}
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_reads_installation_and_headers() {
        let verifier = SourceControlVerifier::new(None);
        let delivery = verifier
            .parse(
                &headers(&[
                    (GITHUB_EVENT_HEADER, "push"),
                    (GITHUB_DELIVERY_HEADER, "d-1"),
                    (GITHUB_SIGNATURE_HEADER, "sha1=abc"),
                ]),
                &push_body(serde_json::json!(4242)),
            )
            .unwrap();

        assert_eq!(delivery.installation_id, "4242");
        assert_eq!(delivery.event_kind.as_deref(), Some("push"));
        assert_eq!(delivery.delivery_id.as_deref(), Some("d-1"));
        assert_eq!(delivery.signature.as_deref(), Some("sha1=abc"));
    }

    #[test]
    fn test_parse_rejects_missing_installation() {
        let verifier = SourceControlVerifier::new(None);
        let body = serde_json::to_vec(&serde_json::json!({"zen": "hi"})).unwrap();
        let err = verifier.parse(&HeaderMap::new(), &body).unwrap_err();
        assert!(matches!(err, VerifyError::MalformedPayload(_)));

        let err = verifier.parse(&HeaderMap::new(), b"{").unwrap_err();
        assert!(matches!(err, VerifyError::MalformedPayload(_)));
    }

    #[test]
    fn test_signature_enforced_when_secret_configured() {
        let verifier = SourceControlVerifier::new(Some("gh-secret".to_string()));
        let body = push_body(serde_json::json!("77"));
        let digest = hmac_sha256_hex(b"gh-secret", &body).unwrap();

        let good = headers(&[(GITHUB_SIGNATURE_256_HEADER, &format!("sha256={digest}"))]);
        assert_eq!(verifier.parse(&good, &body).unwrap().installation_id, "77");

        let bad = headers(&[(GITHUB_SIGNATURE_256_HEADER, "sha256=00ff")]);
        assert!(matches!(
            verifier.parse(&bad, &body),
            Err(VerifyError::InvalidSignature(_))
        ));

        let legacy = headers(&[(GITHUB_SIGNATURE_HEADER, "sha1=00ff")]);
        assert!(verifier.parse(&legacy, &body).is_err());
    }

    #[test]
    fn test_provider_signature_parse() {
        assert_eq!(
            ProviderSignature::parse("SHA256=ABCD"),
            Some(ProviderSignature {
                algorithm: "sha256".to_string(),
                digest: "abcd".to_string(),
            })
        );
        assert_eq!(ProviderSignature::parse("sha256="), None);
        assert_eq!(ProviderSignature::parse("nonsense"), None);
    }

    #[tokio::test]
    async fn test_resolve_unknown_installation() {
        let store = MemoryStore::new();
        let verifier = SourceControlVerifier::new(None);
        let delivery = verifier
            .parse(&HeaderMap::new(), &push_body(serde_json::json!(1)))
            .unwrap();

        let err = verifier
            .resolve(&store, &delivery, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Verification(VerifyError::UnknownIntegration(id)) if id == "1"
        ));
    }
}
