//! Policy command: record a policy document and report what it contains.

use std::io::Write;

use anyhow::{Context, Result};
use ql_core::PolicySet;
use ql_engine::Engine;

pub fn run<W: Write>(writer: &mut W, engine: &Engine, set: PolicySet) -> Result<()> {
    let count = set.policies().len();
    let rules: usize = set.policies().iter().map(|p| p.rules.len()).sum();
    let event = engine
        .load_policies(set)
        .context("failed to record policy update")?;
    writeln!(
        writer,
        "Loaded {count} policies with {rules} rules (event {})",
        event.event_id
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::Config;
    use crate::commands::{open_engine, read_policy_file};

    #[test]
    fn records_policy_file() {
        let temp = tempfile::tempdir().unwrap();
        let engine = open_engine(&Config {
            database_path: temp.path().join("ql.db"),
            ..Config::default()
        })
        .unwrap();
        let path = temp.path().join("policies.json");
        std::fs::write(
            &path,
            r#"{"policies":[
                {"id":"a","scope":"global","rules":[{"condition":"remaining < 5","action":"deny"}]},
                {"id":"b","scope":"team-b","rules":[]}
            ]}"#,
        )
        .unwrap();

        let mut output = Vec::new();
        run(&mut output, &engine, read_policy_file(&path).unwrap()).unwrap();

        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("Loaded 2 policies with 1 rules (event policy_updated_"));
        assert_eq!(engine.projections().constraint_graph.constraints_for_scope("team-b").len(), 1);
        assert!(engine.policy().active().is_some());
    }

    #[test]
    fn rejects_invalid_policy_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("policies.json");
        std::fs::write(&path, r#"{"policies":[{"id":"a","type":"strict"}]}"#).unwrap();

        let err = read_policy_file(&path).unwrap_err();
        assert!(err.to_string().starts_with("invalid policy file"));
    }
}
