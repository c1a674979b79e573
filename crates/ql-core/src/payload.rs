//! Typed payloads for the event types the core folds or emits.
//!
//! Payloads carry absolute values only. Re-applying any of them leaves a
//! projection in the same state, which keeps tail replay after a restore safe.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::currency::MicroUsd;
use crate::event_type::EventType;
use crate::forecast::Forecast;
use crate::policy_engine::Decision;
use crate::types::ValidationError;

fn check<T: serde::de::DeserializeOwned>(event_type: EventType, payload: &Value) -> Result<(), ValidationError> {
    T::deserialize(payload)
        .map(drop)
        .map_err(|e| ValidationError::InvalidPayload {
            event_type: event_type.to_string(),
            message: e.to_string(),
        })
}

/// Checks that `payload` decodes into the shape registered for `event_type`.
///
/// Types without a registered shape accept any JSON object.
pub fn validate(event_type: EventType, payload: &Value) -> Result<(), ValidationError> {
    match event_type {
        EventType::ProviderPollObserved => check::<ProviderPollObserved>(event_type, payload),
        EventType::ProviderError => check::<ProviderError>(event_type, payload),
        EventType::UsageObserved => check::<UsageObserved>(event_type, payload),
        EventType::ResetObserved => check::<ResetObserved>(event_type, payload),
        EventType::ForecastComputed => check::<ForecastComputed>(event_type, payload),
        EventType::IdentityRegistered => check::<IdentityRegistered>(event_type, payload),
        EventType::PolicyUpdated => check::<PolicyUpdated>(event_type, payload),
        EventType::IntentDecided => check::<IntentDecided>(event_type, payload),
        _ if payload.is_object() => Ok(()),
        _ => Err(ValidationError::InvalidPayload {
            event_type: event_type.to_string(),
            message: "payload must be a JSON object".into(),
        }),
    }
}

/// Payload of `provider_poll_observed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPollObserved {
    pub provider_id: String,
    pub status: String,
    #[serde(default)]
    pub observation_summary: ObservationSummary,
    /// Opaque driver state restored into the provider after a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationSummary {
    pub usage_count: usize,
}

/// Payload of `provider_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    pub provider_id: String,
    pub status: String,
    pub message: String,
}

/// Payload of `usage_observed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageObserved {
    pub provider_id: String,
    pub pool_id: String,
    pub used: i64,
    pub remaining: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cost: MicroUsd,
}

/// Payload of `reset_observed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetObserved {
    pub provider_id: String,
    pub pool_id: String,
    pub reset_at: DateTime<Utc>,
}

/// Payload of `forecast_computed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastComputed {
    pub provider_id: String,
    pub pool_id: String,
    pub forecast: Forecast,
}

/// Payload of `identity_registered`. The identity id is the event's
/// `identity_id` dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRegistered {
    pub kind: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_hash: Option<String>,
}

/// The part of a `policy_updated` payload the constraint graph needs.
///
/// The full payload is the serialized policy document; extra fields are
/// ignored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyUpdated {
    #[serde(default)]
    pub policies: Vec<PolicySummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub id: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Payload of `intent_decided`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDecided {
    pub intent_id: String,
    pub provider_id: String,
    pub pool_id: String,
    pub expected_cost: i64,
    pub decision: Decision,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}
