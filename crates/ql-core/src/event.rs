//! The immutable event envelope recorded in the log.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event_type::EventType;
use crate::types::{EventId, ValidationError};

/// Placeholder for dimensions owned by the system itself.
pub const SENTINEL_SYSTEM: &str = "sentinel:system";
/// Placeholder for dimensions that apply everywhere.
pub const SENTINEL_GLOBAL: &str = "sentinel:global";
/// Placeholder for unknown dimensions or a missing causation link.
pub const SENTINEL_UNKNOWN: &str = "sentinel:unknown";

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Who produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub origin_kind: String,
    pub origin_id: String,
    pub writer_id: String,
}

impl Source {
    pub fn new(
        origin_kind: impl Into<String>,
        origin_id: impl Into<String>,
        writer_id: impl Into<String>,
    ) -> Self {
        Self {
            origin_kind: origin_kind.into(),
            origin_id: origin_id.into(),
            writer_id: writer_id.into(),
        }
    }
}

/// Attribution dimensions. All four are mandatory; use the sentinels when
/// one does not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub agent_id: String,
    pub identity_id: String,
    pub workload_id: String,
    pub scope_id: String,
}

impl Dimensions {
    /// Dimensions for events the system emits on its own behalf.
    pub fn system() -> Self {
        Self {
            agent_id: SENTINEL_SYSTEM.to_string(),
            identity_id: SENTINEL_GLOBAL.to_string(),
            workload_id: SENTINEL_SYSTEM.to_string(),
            scope_id: SENTINEL_GLOBAL.to_string(),
        }
    }

    /// System dimensions attributed to a single identity.
    pub fn for_identity(identity_id: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            ..Self::system()
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let fields = [
            (&self.agent_id, "agent_id"),
            (&self.identity_id, "identity_id"),
            (&self.workload_id, "workload_id"),
            (&self.scope_id, "scope_id"),
        ];
        for (value, field) in fields {
            if value.trim().is_empty() {
                return Err(ValidationError::Empty { field });
            }
        }
        Ok(())
    }
}

/// Links an event to the flow it belongs to and the event that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub correlation_id: String,
    pub causation_id: String,
}

impl Correlation {
    /// A fresh flow with no known cause.
    pub fn root(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            causation_id: SENTINEL_UNKNOWN.to_string(),
        }
    }

    /// Continues `parent`'s flow with `parent` as the cause.
    pub fn caused_by(parent: &Event) -> Self {
        Self {
            correlation_id: parent.correlation.correlation_id.clone(),
            causation_id: parent.event_id.to_string(),
        }
    }
}

/// A recorded fact. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub event_type: EventType,
    pub schema_version: u32,
    /// When the fact occurred.
    pub ts_event: DateTime<Utc>,
    /// When the fact was recorded. Ordering and replay use this field only.
    pub ts_ingest: DateTime<Utc>,
    /// Writer leadership term; 0 when no election is in play.
    pub epoch: i64,
    pub source: Source,
    pub dimensions: Dimensions,
    pub correlation: Correlation,
    pub payload: Value,
}

impl Event {
    /// Checks the invariants the log enforces before persisting.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.dimensions.validate()?;
        if self.source.writer_id.trim().is_empty() {
            return Err(ValidationError::Empty { field: "writer_id" });
        }
        if self.correlation.correlation_id.is_empty() {
            return Err(ValidationError::Empty {
                field: "correlation_id",
            });
        }
        Ok(())
    }

    /// Decodes the payload into the shape registered for this event type.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ValidationError::InvalidPayload {
            event_type: self.event_type.to_string(),
            message: format!("{} ({})", e, self.event_id),
        })
    }
}

/// An event that has not yet been assigned an id, ingest time, or epoch.
///
/// The write path fills those in when appending.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub ts_event: DateTime<Utc>,
    pub source: Source,
    pub dimensions: Dimensions,
    pub correlation: Correlation,
    pub payload: Value,
}

impl EventDraft {
    pub fn new(event_type: EventType, ts_event: DateTime<Utc>, payload: Value) -> Self {
        Self {
            event_type,
            ts_event,
            source: Source::new("daemon", "engine", "ql"),
            dimensions: Dimensions::system(),
            correlation: Correlation::root(SENTINEL_UNKNOWN),
            payload,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = dimensions;
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    /// Seals the draft into an event.
    pub fn into_event(self, event_id: EventId, ts_ingest: DateTime<Utc>, epoch: i64) -> Event {
        Event {
            event_id,
            event_type: self.event_type,
            schema_version: SCHEMA_VERSION,
            ts_event: self.ts_event,
            ts_ingest,
            epoch,
            source: self.source,
            dimensions: self.dimensions,
            correlation: self.correlation,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::TimeZone;

    use super::*;

    /// A system event with a deterministic ingest time `secs` past a fixed origin.
    pub fn event_at(id: &str, event_type: EventType, secs: i64, payload: Value) -> Event {
        let ts = Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs);
        EventDraft::new(event_type, ts, payload).into_event(EventId::new(id).unwrap(), ts, 0)
    }
}
