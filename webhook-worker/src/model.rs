//! Domain records shared by the receiver and the processor.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Incoming events
// =============================================================================

/// Which provider family an inbound webhook came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    SourceControl,
    Billing,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::SourceControl => "source_control",
            SourceType::Billing => "billing",
        }
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source_control" => Ok(SourceType::SourceControl),
            "billing" => Ok(SourceType::Billing),
            other => Err(format!("unknown source type: {other}")),
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing lifecycle of a recorded event.
///
/// `Pending` is the only non-terminal state. Transient failures leave the
/// record in `Pending` so the queue can redeliver it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Pending,
    Processed,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Pending => "pending",
            ProcessingState::Processed => "processed",
            ProcessingState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessingState::Pending)
    }
}

impl FromStr for ProcessingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingState::Pending),
            "processed" => Ok(ProcessingState::Processed),
            "failed" => Ok(ProcessingState::Failed),
            other => Err(format!("unknown processing state: {other}")),
        }
    }
}

/// An inbound webhook as persisted by the recorder. The payload never changes
/// after creation; only the processing fields move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingEvent {
    pub id: Uuid,
    pub tenant_id: Option<String>,
    pub integration_id: Option<String>,
    pub source_type: SourceType,
    pub event_kind: Option<String>,
    pub provider_event_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub raw_payload: serde_json::Value,
    pub processing_state: ProcessingState,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Fields supplied by the recorder when creating an [`IncomingEvent`].
#[derive(Debug, Clone)]
pub struct NewIncomingEvent {
    pub tenant_id: Option<String>,
    pub integration_id: Option<String>,
    pub source_type: SourceType,
    pub event_kind: Option<String>,
    pub provider_event_id: Option<String>,
    pub raw_payload: serde_json::Value,
}

impl NewIncomingEvent {
    /// Materialize the record with a fresh id in the `Pending` state.
    pub fn into_event(self, received_at: DateTime<Utc>) -> IncomingEvent {
        IncomingEvent {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            integration_id: self.integration_id,
            source_type: self.source_type,
            event_kind: self.event_kind,
            provider_event_id: self.provider_event_id,
            received_at,
            raw_payload: self.raw_payload,
            processing_state: ProcessingState::Pending,
            error: None,
            processed_at: None,
        }
    }
}

// =============================================================================
// Tenants and integrations
// =============================================================================

/// Commercial plan tiers a tenant can be on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Essential,
    Growth,
    EagleEye,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Essential => "essential",
            Plan::Growth => "growth",
            Plan::EagleEye => "eagle_eye",
        }
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "essential" => Ok(Plan::Essential),
            "growth" => Ok(Plan::Growth),
            "eagle_eye" | "eagleeye" | "eagle-eye" => Ok(Plan::EagleEye),
            other => Err(format!("unknown plan: {other}")),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing state of a tenant. `version` is bumped on every write and checked
/// on update to detect concurrent writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub plan: Plan,
    pub is_trial_plan: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub billing_subscription_id: Option<String>,
    pub plan_subscription_ends_at: Option<DateTime<Utc>>,
    pub plan_updated_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Tenant {
    /// A tenant on the default trial plan.
    pub fn trial(id: impl Into<String>, trial_ends_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.into(),
            plan: Plan::Essential,
            is_trial_plan: true,
            trial_ends_at,
            billing_subscription_id: None,
            plan_subscription_ends_at: None,
            plan_updated_at: None,
            version: 0,
        }
    }
}

/// External platform an integration is installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformType {
    Github,
}

impl PlatformType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::Github => "github",
        }
    }
}

/// Link between an external installation and an internal tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    pub tenant_id: String,
    pub platform_type: PlatformType,
    pub external_identifier: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_parsing_accepts_aliases() {
        assert_eq!("growth".parse::<Plan>(), Ok(Plan::Growth));
        assert_eq!("Eagle-Eye".parse::<Plan>(), Ok(Plan::EagleEye));
        assert_eq!("eagleEye".parse::<Plan>(), Ok(Plan::EagleEye));
        assert!("platinum".parse::<Plan>().is_err());
    }

    #[test]
    fn test_processing_state_terminality() {
        assert!(!ProcessingState::Pending.is_terminal());
        assert!(ProcessingState::Processed.is_terminal());
        assert!(ProcessingState::Failed.is_terminal());
        assert_eq!(
            "failed".parse::<ProcessingState>(),
            Ok(ProcessingState::Failed)
        );
    }

    #[test]
    fn test_new_event_starts_pending() {
        let event = NewIncomingEvent {
            tenant_id: Some("t1".to_string()),
            integration_id: None,
            source_type: SourceType::Billing,
            event_kind: Some("invoice.payment_succeeded".to_string()),
            provider_event_id: Some("evt_1".to_string()),
            raw_payload: serde_json::json!({"id": "evt_1"}),
        }
        .into_event(Utc::now());

        assert_eq!(event.processing_state, ProcessingState::Pending);
        assert!(event.processed_at.is_none());
        assert_eq!(event.source_type.to_string(), "billing");
    }
}
