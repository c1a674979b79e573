//! Hourly and daily usage rollups, driven by a high-water mark kept in
//! system state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ql_core::EventType;
use ql_core::payload::UsageObserved;
use ql_db::{Bucket, DbError, EventLog, UsageStat, format_timestamp, parse_timestamp};

use crate::error::EngineError;

/// System-state key holding the ingest time of the last rolled-up event.
pub const ROLLUP_HWM_KEY: &str = "rollup_hwm_ts";

/// (bucket start, provider, pool, identity, scope)
type StatKey = (DateTime<Utc>, String, String, String, String);

fn high_water_mark(log: &EventLog) -> Result<Option<DateTime<Utc>>, EngineError> {
    match log.get_system_state(ROLLUP_HWM_KEY) {
        Ok(value) => Ok(Some(parse_timestamp(&value, ROLLUP_HWM_KEY)?)),
        Err(DbError::NotFound { .. }) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn aggregate(bucket: Bucket, readings: &[(DateTime<Utc>, &str, &str, UsageObserved)]) -> Vec<UsageStat> {
    let mut stats: BTreeMap<StatKey, UsageStat> = BTreeMap::new();
    for (ts_event, identity_id, scope_id, usage) in readings {
        let bucket_ts = bucket.truncate(*ts_event);
        let key = (
            bucket_ts,
            usage.provider_id.clone(),
            usage.pool_id.clone(),
            (*identity_id).to_string(),
            (*scope_id).to_string(),
        );
        stats
            .entry(key)
            .and_modify(|stat| {
                stat.min_usage = stat.min_usage.min(usage.used);
                stat.max_usage = stat.max_usage.max(usage.used);
                stat.total_usage = stat.max_usage - stat.min_usage;
                stat.event_count += 1;
            })
            .or_insert_with(|| UsageStat {
                bucket_ts,
                provider_id: usage.provider_id.clone(),
                pool_id: usage.pool_id.clone(),
                identity_id: (*identity_id).to_string(),
                scope_id: (*scope_id).to_string(),
                total_usage: 0,
                min_usage: usage.used,
                max_usage: usage.used,
                event_count: 1,
            });
    }
    stats.into_values().collect()
}

/// Rolls up to `batch_size` events past the high-water mark.
///
/// Returns how many events were read. Zero means the rollup is caught up.
/// Usage rows are bucketed by `ts_event`; the mark advances by ingest time
/// over every event read, usage or not.
pub fn rollup_batch(log: &EventLog, batch_size: usize) -> Result<usize, EngineError> {
    let since = high_water_mark(log)?;
    let events = log.read_events(since, batch_size)?;
    let Some(last) = events.last() else {
        return Ok(0);
    };

    let mut readings = Vec::new();
    for event in events.iter().filter(|e| e.event_type == EventType::UsageObserved) {
        let usage: UsageObserved = event.decode_payload()?;
        readings.push((
            event.ts_event,
            event.dimensions.identity_id.as_str(),
            event.dimensions.scope_id.as_str(),
            usage,
        ));
    }

    let batches = [Bucket::Hour, Bucket::Day].map(|bucket| (bucket, aggregate(bucket, &readings)));
    log.commit_rollup(&batches, ROLLUP_HWM_KEY, &format_timestamp(last.ts_ingest))?;

    tracing::debug!(events = events.len(), usage = readings.len(), "rolled up usage");
    Ok(events.len())
}
