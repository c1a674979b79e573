use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Cursor, Guarded, Projection, ProjectionError, ProjectionState, read, write};
use crate::currency::MicroUsd;
use crate::event::Event;
use crate::event_type::EventType;
use crate::forecast::Forecast;
use crate::payload::{ForecastComputed, ResetObserved, UsageObserved};
use crate::types::PoolKey;

/// Current consumption of one quota pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub provider_id: String,
    pub pool_id: String,
    pub used: i64,
    pub remaining: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cost: MicroUsd,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_forecast: Option<Forecast>,
}

impl PoolState {
    pub fn new(provider_id: impl Into<String>, pool_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            pool_id: pool_id.into(),
            used: 0,
            remaining: 0,
            limit: None,
            cost: MicroUsd::ZERO,
            reset_at: None,
            last_updated: None,
            latest_forecast: None,
        }
    }

    pub fn key(&self) -> PoolKey {
        PoolKey::new(&self.provider_id, &self.pool_id)
    }
}

/// Pool states keyed by (provider, pool).
#[derive(Debug, Default)]
pub struct UsageProjection {
    inner: RwLock<Guarded<BTreeMap<PoolKey, PoolState>>>,
}

impl UsageProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(&self, provider_id: &str, pool_id: &str) -> Option<PoolState> {
        read(&self.inner)
            .data
            .get(&PoolKey::new(provider_id, pool_id))
            .cloned()
    }

    pub fn pools(&self) -> Vec<PoolState> {
        read(&self.inner).data.values().cloned().collect()
    }

    /// Seconds from `now` until the pool resets; 0 when unknown or past.
    #[expect(
        clippy::cast_precision_loss,
        reason = "milliseconds to reset stay far below 2^53"
    )]
    pub fn seconds_until_reset(&self, provider_id: &str, pool_id: &str, now: DateTime<Utc>) -> f64 {
        self.pool(provider_id, pool_id)
            .and_then(|p| p.reset_at)
            .map_or(0.0, |reset_at| {
                ((reset_at - now).num_milliseconds() as f64 / 1000.0).max(0.0)
            })
    }
}

fn entry<'a>(
    pools: &'a mut BTreeMap<PoolKey, PoolState>,
    provider_id: &str,
    pool_id: &str,
) -> &'a mut PoolState {
    pools
        .entry(PoolKey::new(provider_id, pool_id))
        .or_insert_with(|| PoolState::new(provider_id, pool_id))
}

impl Projection for UsageProjection {
    type View = Vec<PoolState>;

    const NAME: &'static str = "usage";

    fn apply(&self, event: &Event) -> Result<(), ProjectionError> {
        let mut guard = write(&self.inner);
        match event.event_type {
            EventType::UsageObserved => {
                let payload: UsageObserved = event.decode_payload()?;
                let state = entry(&mut guard.data, &payload.provider_id, &payload.pool_id);
                state.used = payload.used;
                state.remaining = payload.remaining;
                state.cost = payload.cost;
                if payload.limit.is_some() {
                    state.limit = payload.limit;
                }
                state.last_updated = Some(event.ts_ingest);
            }
            EventType::ResetObserved => {
                let payload: ResetObserved = event.decode_payload()?;
                let state = entry(&mut guard.data, &payload.provider_id, &payload.pool_id);
                state.reset_at = Some(payload.reset_at);
                state.last_updated = Some(event.ts_ingest);
            }
            EventType::ForecastComputed => {
                let payload: ForecastComputed = event.decode_payload()?;
                let state = entry(&mut guard.data, &payload.provider_id, &payload.pool_id);
                state.latest_forecast = Some(payload.forecast);
                state.last_updated = Some(event.ts_ingest);
            }
            _ => {}
        }
        guard.cursor = Some(Cursor::of(event));
        Ok(())
    }

    fn state(&self) -> ProjectionState<Self::View> {
        let guard = read(&self.inner);
        ProjectionState {
            cursor: guard.cursor.clone(),
            view: guard.data.values().cloned().collect(),
        }
    }

    fn load_state(&self, cursor: Option<Cursor>, view: Self::View) {
        let mut guard = write(&self.inner);
        guard.cursor = cursor;
        guard.data = view.into_iter().map(|p| (p.key(), p)).collect();
    }
}
