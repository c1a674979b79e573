//! End-to-end tests for the durable lifecycle of a ledger database.
//!
//! Tests the full pipeline: ingest → snapshot → prune/archive → reopen → restore

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use ql_core::{EventType, Intent, PolicySet};
use ql_db::{EventFilter, EventLog};
use ql_engine::{
    Archiver, BlobSink, Engine, EngineOptions, LocalDirSink, PollResult, PoolObservation,
    RetentionPolicy, StandaloneGate,
};
use tempfile::TempDir;

fn open_engine(path: &Path) -> Engine {
    let log = Arc::new(EventLog::open(path).expect("open ledger"));
    Engine::new(log, Arc::new(StandaloneGate::new(1)), EngineOptions::default()).unwrap()
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

fn seed(engine: &Engine) {
    engine
        .register_identity("svc-1", "service", BTreeMap::new(), None)
        .unwrap();
    engine
        .load_policies(
            PolicySet::from_json(
                r#"{"policies":[{"id":"core-floor","scope":"global","type":"hard","rules":[
                    {"condition":"remaining < 100","action":"deny","params":{"reason":"core pool floor"}}]}]}"#,
            )
            .unwrap(),
        )
        .unwrap();
    for used in [100, 200, 300] {
        engine.ingest_poll(&poll(used)).unwrap();
    }
}

/// A restarted process rebuilds the same projections from snapshot + tail.
#[test]
fn test_restart_restores_projections() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("ledger.db");

    let engine = open_engine(&db);
    seed(&engine);
    engine.take_snapshot(Utc::now()).unwrap();
    engine.ingest_poll(&poll(400)).unwrap();

    let expected_pools = engine.projections().usage.pools();
    let expected_graph = engine.projections().constraint_graph.graph();
    drop(engine);

    let restarted = open_engine(&db);
    let report = restarted.restore().unwrap();
    assert!(report.snapshot_id.is_some());
    assert!(report.replayed > 0);

    let projections = restarted.projections();
    assert_eq!(projections.usage.pools(), expected_pools);
    assert_eq!(projections.constraint_graph.graph(), expected_graph);
    assert_eq!(
        projections.provider_states.state_for("github").as_deref(),
        Some("etag-400")
    );
    assert!(projections.identities.get("svc-1").is_some());
    assert_eq!(projections.forecast_histories.history("github", "core").len(), 4);
}

/// Pruning behind a snapshot keeps restore exact.
#[test]
fn test_prune_then_restore() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("ledger.db");

    let engine = open_engine(&db);
    seed(&engine);
    engine.take_snapshot(Utc::now()).unwrap();
    engine.ingest_poll(&poll(450)).unwrap();
    let before = engine.log().event_count().unwrap();

    let policy = RetentionPolicy {
        default_ttl: Some(TimeDelta::zero()),
        by_type: BTreeMap::new(),
    };
    let pruned = policy.prune(engine.log(), Utc::now()).unwrap();
    assert!(pruned > 0);
    assert_eq!(engine.log().event_count().unwrap(), before - i64::try_from(pruned).unwrap());
    let expected = engine.projections().usage.pools();
    drop(engine);

    let restarted = open_engine(&db);
    restarted.restore().unwrap();
    assert_eq!(restarted.projections().usage.pools(), expected);
    assert!(restarted.projections().identities.get("svc-1").is_some());
}

/// Archived events land in the sink before they leave the log.
#[test]
fn test_archive_moves_cold_events() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(&temp.path().join("ledger.db"));
    seed(&engine);
    engine.take_snapshot(Utc::now()).unwrap();

    let sink = LocalDirSink::new(temp.path().join("archive"));
    let archiver = Archiver::new(
        Arc::clone(engine.log()),
        Arc::new(sink.clone()) as Arc<dyn BlobSink>,
        TimeDelta::zero(),
        1000,
    );
    let deleted = archiver.archive_batch(Utc::now()).unwrap();
    assert!(deleted > 0);

    let blobs: Vec<_> = walk(sink.root());
    assert_eq!(blobs.len(), 1);
    assert!(blobs[0].to_string_lossy().ends_with(".jsonl.gz"));

    // The snapshot boundary and everything after it survive.
    let boundary = engine.log().snapshot_boundary().unwrap().unwrap();
    assert!(engine.log().get_event(boundary.last_event_id.as_str()).unwrap().is_some());
}

/// Decisions are recorded and reflect the active policy.
#[test]
fn test_intent_decisions_are_logged() {
    let temp = TempDir::new().unwrap();
    let engine = open_engine(&temp.path().join("ledger.db"));
    seed(&engine);
    engine.ingest_poll(&poll(4950)).unwrap();

    let outcome = engine
        .submit_intent(&Intent {
            agent_id: "agent-1".into(),
            identity_id: "svc-1".into(),
            workload_id: "nightly".into(),
            scope_id: "team-a".into(),
            provider_id: "github".into(),
            pool_id: "core".into(),
            expected_cost: 1,
            ..Intent::default()
        })
        .unwrap();
    assert_eq!(outcome.result.reason, "core pool floor");

    let decided = engine
        .log()
        .query(&EventFilter {
            event_types: vec![EventType::IntentDecided],
            identity_id: Some("svc-1".into()),
            ..EventFilter::default()
        })
        .unwrap();
    assert_eq!(decided.len(), 1);
    assert_eq!(decided[0].payload["decision"], "deny_with_reason");
}

fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(walk(&path));
        } else {
            files.push(path);
        }
    }
    files
}
