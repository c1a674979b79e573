//! Event type enum as the single source of truth for event type strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical event types recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    ProviderPollObserved,
    ProviderError,
    ConstraintObserved,
    ResetObserved,
    UsageObserved,
    ForecastComputed,
    IntentSubmitted,
    IntentDecided,
    PolicyTriggered,
    ThrottleAdvised,
    IdentityRegistered,
    IdentityDeleted,
    PolicyUpdated,
    GrantIssued,
}

impl EventType {
    /// Every variant, in declaration order.
    pub const ALL: [Self; 14] = [
        Self::ProviderPollObserved,
        Self::ProviderError,
        Self::ConstraintObserved,
        Self::ResetObserved,
        Self::UsageObserved,
        Self::ForecastComputed,
        Self::IntentSubmitted,
        Self::IntentDecided,
        Self::PolicyTriggered,
        Self::ThrottleAdvised,
        Self::IdentityRegistered,
        Self::IdentityDeleted,
        Self::PolicyUpdated,
        Self::GrantIssued,
    ];

    /// String representation for database storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProviderPollObserved => "provider_poll_observed",
            Self::ProviderError => "provider_error",
            Self::ConstraintObserved => "constraint_observed",
            Self::ResetObserved => "reset_observed",
            Self::UsageObserved => "usage_observed",
            Self::ForecastComputed => "forecast_computed",
            Self::IntentSubmitted => "intent_submitted",
            Self::IntentDecided => "intent_decided",
            Self::PolicyTriggered => "policy_triggered",
            Self::ThrottleAdvised => "throttle_advised",
            Self::IdentityRegistered => "identity_registered",
            Self::IdentityDeleted => "identity_deleted",
            Self::PolicyUpdated => "policy_updated",
            Self::GrantIssued => "grant_issued",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|variant| variant.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error type for unknown event type strings.
#[derive(Debug, Clone)]
pub struct UnknownEventType(String);

impl fmt::Display for UnknownEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for UnknownEventType {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_variants() {
        for variant in EventType::ALL {
            let s = variant.to_string();
            let parsed: EventType = s.parse().expect("should parse");
            assert_eq!(parsed, variant, "roundtrip failed for {variant:?}");
        }
    }

    #[test]
    fn serde_uses_snake_case_strings() {
        let json = serde_json::to_string(&EventType::UsageObserved).unwrap();
        assert_eq!(json, "\"usage_observed\"");
        let parsed: EventType = serde_json::from_str("\"forecast_computed\"").unwrap();
        assert_eq!(parsed, EventType::ForecastComputed);
    }

    #[test]
    fn unknown_type_errors() {
        let result: Result<EventType, _> = "usage_guessed".parse();
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "unknown event type: usage_guessed");
    }
}
