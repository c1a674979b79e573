//! Snapshot and prune commands.

use std::io::Write;

use anyhow::Result;
use chrono::Utc;
use ql_engine::{Engine, RetentionPolicy};

pub fn snapshot<W: Write>(writer: &mut W, engine: &Engine) -> Result<()> {
    match engine.take_snapshot(Utc::now()) {
        Ok(snapshot) => writeln!(
            writer,
            "Saved {} at boundary {}",
            snapshot.snapshot_id, snapshot.last_event_id
        )?,
        Err(err) if err.is_expected_skip() => writeln!(writer, "Nothing to snapshot yet: {err}")?,
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

pub fn prune<W: Write>(writer: &mut W, engine: &Engine, policy: &RetentionPolicy) -> Result<()> {
    if policy.default_ttl.is_none() && policy.by_type.is_empty() {
        writeln!(writer, "No retention configured.")?;
        return Ok(());
    }
    match policy.prune(engine.log(), Utc::now()) {
        Ok(deleted) => writeln!(writer, "Pruned {deleted} events")?,
        Err(err) if err.is_expected_skip() => writeln!(writer, "Skipped: {err}")?,
        Err(err) => return Err(err.into()),
    }
    Ok(())
}
