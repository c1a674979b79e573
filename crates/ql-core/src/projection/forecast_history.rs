use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::{Cursor, Guarded, Projection, ProjectionError, ProjectionState, read, write};
use crate::event::Event;
use crate::event_type::EventType;
use crate::forecast::UsagePoint;
use crate::payload::UsageObserved;
use crate::types::PoolKey;

/// History length kept per pool when none is configured.
pub const DEFAULT_WINDOW: usize = 20;

/// Fixed-capacity ring; the oldest point is overwritten once full.
#[derive(Debug, Clone)]
struct Ring {
    points: Vec<UsagePoint>,
    /// Next write position once the ring is full, which is also the oldest point.
    head: usize,
    capacity: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    fn latest(&self) -> Option<&UsagePoint> {
        if self.points.len() < self.capacity {
            self.points.last()
        } else {
            self.points.get((self.head + self.capacity - 1) % self.capacity)
        }
    }

    fn push(&mut self, point: UsagePoint) {
        if self.points.len() < self.capacity {
            self.points.push(point);
        } else {
            self.points[self.head] = point;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    fn chronological(&self) -> Vec<UsagePoint> {
        let (newer, older) = self.points.split_at(self.head);
        older.iter().chain(newer).copied().collect()
    }
}

/// One pool's history in chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHistory {
    pub provider_id: String,
    pub pool_id: String,
    pub points: Vec<UsagePoint>,
}

/// Bounded per-pool usage history feeding the forecast model.
#[derive(Debug)]
pub struct ForecastProjection {
    capacity: usize,
    inner: RwLock<Guarded<BTreeMap<PoolKey, Ring>>>,
}

impl Default for ForecastProjection {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl ForecastProjection {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::default(),
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// The pool's points, oldest first.
    pub fn history(&self, provider_id: &str, pool_id: &str) -> Vec<UsagePoint> {
        read(&self.inner)
            .data
            .get(&PoolKey::new(provider_id, pool_id))
            .map(Ring::chronological)
            .unwrap_or_default()
    }
}

impl Projection for ForecastProjection {
    type View = Vec<PoolHistory>;

    const NAME: &'static str = "forecast_histories";

    fn apply(&self, event: &Event) -> Result<(), ProjectionError> {
        let mut guard = write(&self.inner);
        if event.event_type == EventType::UsageObserved {
            let payload: UsageObserved = event.decode_payload()?;
            let point = UsagePoint {
                timestamp: event.ts_event,
                used: payload.used,
                remaining: payload.remaining,
                cost: payload.cost,
            };
            let ring = guard
                .data
                .entry(PoolKey::new(payload.provider_id, payload.pool_id))
                .or_insert_with(|| Ring::new(self.capacity));
            if ring.latest() != Some(&point) {
                ring.push(point);
            }
        }
        guard.cursor = Some(Cursor::of(event));
        Ok(())
    }

    fn state(&self) -> ProjectionState<Self::View> {
        let guard = read(&self.inner);
        let view = guard
            .data
            .iter()
            .map(|(key, ring)| PoolHistory {
                provider_id: key.provider_id.clone(),
                pool_id: key.pool_id.clone(),
                points: ring.chronological(),
            })
            .collect();
        ProjectionState {
            cursor: guard.cursor.clone(),
            view,
        }
    }

    fn load_state(&self, cursor: Option<Cursor>, view: Self::View) {
        let mut histories = BTreeMap::new();
        for history in view {
            if history.points.is_empty() {
                continue;
            }
            let mut ring = Ring::new(self.capacity);
            let skip = history.points.len().saturating_sub(self.capacity);
            for point in history.points.into_iter().skip(skip) {
                ring.push(point);
            }
            histories.insert(PoolKey::new(history.provider_id, history.pool_id), ring);
        }
        let mut guard = write(&self.inner);
        guard.cursor = cursor;
        guard.data = histories;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::fixtures::event_at;

    fn usage(id: &str, secs: i64, used: i64) -> Event {
        event_at(
            id,
            EventType::UsageObserved,
            secs,
            json!({"provider_id": "openai", "pool_id": "tokens", "used": used, "remaining": 100 - used}),
        )
    }

    fn used(projection: &ForecastProjection) -> Vec<i64> {
        projection
            .history("openai", "tokens")
            .iter()
            .map(|p| p.used)
            .collect()
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let projection = ForecastProjection::new(3);
        for i in 0..5 {
            projection.apply(&usage(&format!("u{i}"), i, i * 10)).unwrap();
        }
        assert_eq!(used(&projection), vec![20, 30, 40]);
    }

    #[test]
    fn history_is_chronological_before_wrap() {
        let projection = ForecastProjection::new(5);
        for i in 0..3 {
            projection.apply(&usage(&format!("u{i}"), i, i)).unwrap();
        }
        assert_eq!(used(&projection), vec![0, 1, 2]);
    }

    #[test]
    fn reapplying_latest_point_is_a_noop() {
        let projection = ForecastProjection::new(5);
        let event = usage("u1", 0, 10);
        projection.apply(&event).unwrap();
        projection.apply(&event).unwrap();
        assert_eq!(used(&projection), vec![10]);
    }

    #[test]
    fn pools_are_independent() {
        let projection = ForecastProjection::new(5);
        projection.apply(&usage("u1", 0, 10)).unwrap();
        projection
            .apply(&event_at(
                "u2",
                EventType::UsageObserved,
                1,
                json!({"provider_id": "openai", "pool_id": "requests", "used": 1, "remaining": 9}),
            ))
            .unwrap();
        assert_eq!(projection.history("openai", "requests").len(), 1);
        assert_eq!(used(&projection), vec![10]);
    }

    #[test]
    fn load_state_truncates_to_capacity() {
        let source = ForecastProjection::new(10);
        for i in 0..6 {
            source.apply(&usage(&format!("u{i}"), i, i)).unwrap();
        }
        let ProjectionState { cursor, view } = source.state();

        let restored = ForecastProjection::new(4);
        restored.load_state(cursor, view);
        assert_eq!(used(&restored), vec![2, 3, 4, 5]);

        restored.apply(&usage("u6", 6, 6)).unwrap();
        assert_eq!(used(&restored), vec![3, 4, 5, 6]);
    }

    #[test]
    fn snapshot_view_round_trips() {
        let source = ForecastProjection::new(3);
        for i in 0..4 {
            source.apply(&usage(&format!("u{i}"), i, i)).unwrap();
        }
        let restored = ForecastProjection::new(3);
        let state = source.state();
        restored.load_state(state.cursor.clone(), state.view.clone());
        assert_eq!(restored.state(), state);
    }
}
