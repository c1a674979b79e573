//! Identity commands.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result};
use ql_engine::Engine;

pub fn register<W: Write>(
    writer: &mut W,
    engine: &Engine,
    id: &str,
    kind: &str,
    token_hash: Option<String>,
) -> Result<()> {
    let event = engine
        .register_identity(id, kind, BTreeMap::new(), token_hash)
        .with_context(|| format!("failed to register identity {id}"))?;
    writeln!(writer, "Registered {id} ({kind}) in event {}", event.event_id)?;
    Ok(())
}

pub fn delete<W: Write>(writer: &mut W, engine: &Engine, id: &str) -> Result<()> {
    let event = engine
        .delete_identity(id)
        .with_context(|| format!("failed to delete identity {id}"))?;
    writeln!(writer, "Deleted {id} in event {}", event.event_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::Config;
    use crate::commands::open_engine;

    #[test]
    fn register_survives_restart_and_delete_requires_existing() {
        let temp = tempfile::tempdir().unwrap();
        let config = Config {
            database_path: temp.path().join("ql.db"),
            ..Config::default()
        };

        let mut output = Vec::new();
        register(&mut output, &open_engine(&config).unwrap(), "svc-1", "service", None).unwrap();

        let engine = open_engine(&config).unwrap();
        assert_eq!(engine.projections().identities.get("svc-1").unwrap().kind, "service");
        delete(&mut output, &engine, "svc-1").unwrap();

        let err = delete(&mut output, &open_engine(&config).unwrap(), "svc-1").unwrap_err();
        assert!(err.to_string().contains("failed to delete identity svc-1"));
    }
}
