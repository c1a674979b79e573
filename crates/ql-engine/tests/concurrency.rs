//! Concurrent readers, snapshots and a writer sharing one engine.
//!
//! Every checkpoint taken mid-stream must sit on a log prefix and restore
//! to the state that prefix folds to.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{TimeDelta, Utc};
use ql_core::projection::{ConstraintGraph, Identity, PoolState};
use ql_core::{Event, PolicySet};
use ql_db::{EventLog, Snapshot};
use ql_engine::{Engine, EngineOptions, PollResult, PoolObservation, StandaloneGate};
use tempfile::TempDir;

const POLLS: i64 = 120;

fn engine_on(log: EventLog) -> Engine {
    Engine::new(Arc::new(log), Arc::new(StandaloneGate::new(1)), EngineOptions::default()).unwrap()
}

fn open_engine(path: &Path) -> Engine {
    engine_on(EventLog::open(path).expect("open ledger"))
}

fn poll(used: i64) -> PollResult {
    PollResult {
        provider_id: "github".into(),
        status: "success".into(),
        timestamp: Utc::now(),
        usage: vec![PoolObservation {
            pool_id: "core".into(),
            used,
            remaining: 5000 - used,
            limit: Some(5000),
            reset_at: Some(Utc::now() + TimeDelta::hours(1)),
            cost: ql_core::MicroUsd::ZERO,
        }],
        state_blob: Some(format!("etag-{used}")),
        error: None,
    }
}

/// Everything a reader can observe through the projections.
#[derive(Debug, PartialEq)]
struct View {
    pools: Vec<PoolState>,
    identities: Vec<Identity>,
    graph: ConstraintGraph,
    provider_state: Option<String>,
    history_len: usize,
}

fn view(engine: &Engine) -> View {
    let projections = engine.projections();
    View {
        pools: projections.usage.pools(),
        identities: projections.identities.all(),
        graph: projections.constraint_graph.graph(),
        provider_state: projections.provider_states.state_for("github"),
        history_len: projections.forecast_histories.history("github", "core").len(),
    }
}

fn all_events(log: &EventLog) -> Vec<Event> {
    let mut events = Vec::new();
    let mut since = None;
    loop {
        let page = log.read_events(since, 500).unwrap();
        let Some(last) = page.last() else {
            return events;
        };
        since = Some(last.ts_ingest);
        events.extend(page);
    }
}

/// Restores a fresh in-memory engine from `events`, optionally seeded with
/// a checkpoint.
fn restored(events: &[Event], snapshot: Option<&Snapshot>) -> View {
    let log = EventLog::open_in_memory().expect("open in-memory db");
    log.append_all(events).unwrap();
    if let Some(snapshot) = snapshot {
        log.save_snapshot(snapshot).unwrap();
    }
    let engine = engine_on(log);
    let report = engine.restore().unwrap();
    assert_eq!(report.snapshot_id.is_some(), snapshot.is_some());
    view(&engine)
}

fn seed(engine: &Engine) {
    engine
        .load_policies(
            PolicySet::from_json(
                r#"{"policies":[{"id":"core-floor","scope":"global","type":"hard","rules":[
                    {"condition":"remaining < 100","action":"deny"}]}]}"#,
            )
            .unwrap(),
        )
        .unwrap();
    engine.ingest_poll(&poll(0)).unwrap();
}

/// Snapshots taken while a writer appends land on a log prefix, and
/// restoring from any of them converges on the live state.
#[test]
fn test_snapshots_under_concurrent_writes() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(&temp.path().join("ledger.db"));
    seed(&engine);
    let writing = AtomicBool::new(true);

    let mut snapshots = std::thread::scope(|s| {
        s.spawn(|| {
            for used in 1..=POLLS {
                engine.ingest_poll(&poll(used)).unwrap();
                if used % 10 == 0 {
                    engine
                        .register_identity(&format!("svc-{used}"), "service", BTreeMap::new(), None)
                        .unwrap();
                }
            }
            writing.store(false, Ordering::Release);
        });

        for _ in 0..2 {
            s.spawn(|| {
                let mut seen = 0;
                while writing.load(Ordering::Acquire) {
                    let pool = engine.projections().usage.pool("github", "core").unwrap();
                    assert!(pool.used >= seen, "usage went backwards: {} < {seen}", pool.used);
                    assert_eq!(pool.used + pool.remaining, 5000);
                    seen = pool.used;
                    let _ = engine.projections().identities.all();
                    let _ = engine.projections().constraint_graph.graph();
                }
            });
        }

        let snapshotter = s.spawn(|| {
            let mut taken = Vec::new();
            loop {
                let running = writing.load(Ordering::Acquire);
                match engine.take_snapshot(Utc::now()) {
                    Ok(snapshot) => taken.push(snapshot),
                    Err(err) => assert!(err.is_expected_skip(), "snapshot failed: {err}"),
                }
                if !running {
                    return taken;
                }
                std::thread::yield_now();
            }
        });
        snapshotter.join().unwrap()
    });

    assert!(!snapshots.is_empty());
    snapshots.dedup_by(|a, b| a.last_event_id == b.last_event_id);
    let live = view(&engine);
    assert_eq!(live.pools[0].used, POLLS);
    let events = all_events(engine.log());

    for snapshot in &snapshots {
        let boundary = events
            .iter()
            .position(|e| e.event_id == snapshot.last_event_id)
            .expect("snapshot boundary is a logged event");
        let prefix = &events[..=boundary];

        assert_eq!(restored(prefix, Some(snapshot)), restored(prefix, None));
        assert_eq!(restored(&events, Some(snapshot)), live);
    }

    let restarted = open_engine(&temp.path().join("ledger.db"));
    restarted.restore().unwrap();
    assert_eq!(view(&restarted), live);
}
