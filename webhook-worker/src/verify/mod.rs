//! Provider signature and identity verification.
//!
//! Verification is pure: nothing here writes state. Failures map onto
//! [`VerifyError`](crate::error::VerifyError).

pub mod billing;
pub mod signature;
pub mod source_control;

pub use billing::{sign_payload, BillingVerifier, VerifiedBillingEvent, STRIPE_SIGNATURE_HEADER};
pub use source_control::{
    ProviderSignature, SourceControlDelivery, SourceControlVerifier, GITHUB_DELIVERY_HEADER,
    GITHUB_EVENT_HEADER, GITHUB_SIGNATURE_256_HEADER, GITHUB_SIGNATURE_HEADER,
};
