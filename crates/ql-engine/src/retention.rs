//! Time-to-live pruning of the event log.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use ql_core::EventType;
use ql_db::{EventLog, TypeFilter};

use crate::error::EngineError;

/// How long events are kept. Per-type entries override the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Applies to every type without its own entry. `None` keeps them forever.
    pub default_ttl: Option<TimeDelta>,
    pub by_type: BTreeMap<EventType, TimeDelta>,
}

impl RetentionPolicy {
    /// One pruning pass. Returns the number of events deleted.
    ///
    /// Nothing at or after the latest snapshot boundary is touched; with no
    /// snapshot the pass fails with `NoSnapshot` before deleting anything.
    pub fn prune(&self, log: &EventLog, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut deleted = 0;
        if let Some(ttl) = self.default_ttl {
            let excluded = self.by_type.keys().copied().collect();
            deleted += log.prune_events(ttl, now, &TypeFilter::Except(excluded))?;
        }
        for (event_type, ttl) in &self.by_type {
            let removed = log.prune_events(*ttl, now, &TypeFilter::Only(*event_type))?;
            if removed > 0 {
                tracing::debug!(event_type = %event_type, removed, "pruned events by type");
            }
            deleted += removed;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use ql_core::{Event, EventDraft, EventId, SnapshotId};
    use ql_db::{DbError, Snapshot};
    use serde_json::json;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn event(id: &str, event_type: EventType, secs: i64) -> Event {
        EventDraft::new(event_type, at(secs), json!({}))
            .into_event(EventId::new(id).unwrap(), at(secs), 0)
    }

    fn seeded() -> EventLog {
        let log = EventLog::open_in_memory().expect("open in-memory db");
        log.append_all(&[
            event("trigger-old", EventType::PolicyTriggered, 0),
            event("intent-old", EventType::IntentSubmitted, 10),
            event("trigger-mid", EventType::PolicyTriggered, 3_600),
            event("intent-mid", EventType::IntentSubmitted, 3_610),
            event("boundary", EventType::GrantIssued, 7_200),
        ])
        .unwrap();
        log.save_snapshot(&Snapshot {
            snapshot_id: SnapshotId::new("snap").unwrap(),
            schema_version: 1,
            ts_snapshot: at(7_200),
            last_event_id: EventId::new("boundary").unwrap(),
            payload: json!({}),
        })
        .unwrap();
        log
    }

    fn remaining(log: &EventLog) -> Vec<String> {
        let mut ids: Vec<String> = log
            .read_events(None, 100)
            .unwrap()
            .into_iter()
            .map(|e| e.event_id.to_string())
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn per_type_ttl_overrides_default() {
        let log = seeded();
        let policy = RetentionPolicy {
            default_ttl: Some(TimeDelta::hours(1)),
            by_type: BTreeMap::from([(EventType::IntentSubmitted, TimeDelta::minutes(30))]),
        };

        // Now is 2h in: the default removes policy events older than 1h, the
        // override removes intents older than 30m.
        let deleted = policy.prune(&log, at(7_200)).unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(remaining(&log), vec!["boundary", "trigger-mid"]);
    }

    #[test]
    fn without_default_only_listed_types_expire() {
        let log = seeded();
        let policy = RetentionPolicy {
            default_ttl: None,
            by_type: BTreeMap::from([(EventType::PolicyTriggered, TimeDelta::zero())]),
        };

        assert_eq!(policy.prune(&log, at(7_200)).unwrap(), 2);
        assert_eq!(remaining(&log), vec!["boundary", "intent-mid", "intent-old"]);
    }

    #[test]
    fn requires_a_snapshot() {
        let log = EventLog::open_in_memory().expect("open in-memory db");
        log.append(&event("e", EventType::GrantIssued, 0)).unwrap();
        let policy = RetentionPolicy {
            default_ttl: Some(TimeDelta::zero()),
            by_type: BTreeMap::new(),
        };

        let err = policy.prune(&log, at(7_200)).unwrap_err();
        assert!(matches!(err, EngineError::Db(DbError::NoSnapshot)));
        assert!(err.is_expected_skip());
        assert_eq!(log.event_count().unwrap(), 1);
    }
}
