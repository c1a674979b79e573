//! Evaluate command: ask the policy engine about one intent.

use std::io::Write;

use anyhow::{Context, Result};
use ql_core::{Intent, PolicySet};
use ql_engine::Engine;

/// Prints the evaluation as pretty JSON. With `record`, the decision is
/// also appended as `intent_decided`.
pub fn run<W: Write>(
    writer: &mut W,
    engine: &Engine,
    policies: Option<PolicySet>,
    intent: &Intent,
    record: bool,
) -> Result<()> {
    if let Some(set) = policies {
        engine.policy().load(set);
    }

    let json = if record {
        let outcome = engine
            .submit_intent(intent)
            .context("failed to record intent decision")?;
        serde_json::to_string_pretty(&outcome)?
    } else {
        serde_json::to_string_pretty(&engine.evaluate(intent))?
    };
    writeln!(writer, "{json}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use ql_core::EventType;
    use ql_db::EventFilter;
    use ql_engine::{PollResult, PoolObservation};
    use serde_json::Value;

    use crate::Config;
    use crate::commands::open_engine;

    fn intent() -> Intent {
        Intent {
            scope_id: "team-a".into(),
            provider_id: "github".into(),
            pool_id: "core".into(),
            expected_cost: 1,
            ..Intent::default()
        }
    }

    #[test]
    fn evaluation_uses_given_policies_and_records_on_request() {
        let temp = tempfile::tempdir().unwrap();
        let engine = open_engine(&Config {
            database_path: temp.path().join("ql.db"),
            ..Config::default()
        })
        .unwrap();
        engine
            .ingest_poll(&PollResult {
                provider_id: "github".into(),
                status: "success".into(),
                timestamp: chrono::Utc::now(),
                usage: vec![PoolObservation {
                    pool_id: "core".into(),
                    used: 4995,
                    remaining: 5,
                    limit: Some(5000),
                    reset_at: None,
                    cost: ql_core::MicroUsd::ZERO,
                }],
                state_blob: None,
                error: None,
            })
            .unwrap();
        let policies = PolicySet::from_json(
            r#"{"policies":[{"id":"team-a-floor","scope":"team-a","rules":[
                {"condition":"remaining < 10","action":"deny","params":{"reason":"team-a floor"}}]}]}"#,
        )
        .unwrap();

        let mut output = Vec::new();
        run(&mut output, &engine, Some(policies), &intent(), false).unwrap();
        let result: Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(result["decision"], "deny_with_reason");
        assert_eq!(result["reason"], "team-a floor");

        let decided = |engine: &Engine| {
            engine
                .log()
                .query(&EventFilter {
                    event_types: vec![EventType::IntentDecided],
                    ..EventFilter::default()
                })
                .unwrap()
                .len()
        };
        assert_eq!(decided(&engine), 0);

        let mut output = Vec::new();
        run(&mut output, &engine, None, &intent(), true).unwrap();
        let outcome: Value = serde_json::from_slice(&output).unwrap();
        assert!(outcome["intent_id"].as_str().unwrap().starts_with("intent_"));
        assert_eq!(decided(&engine), 1);
    }
}
