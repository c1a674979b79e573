//! CLI subcommand implementations.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ql_core::PolicySet;
use ql_db::EventLog;
use ql_engine::{Engine, StandaloneGate};

use crate::Config;

pub mod evaluate;
pub mod events;
pub mod graph;
pub mod identity;
pub mod ingest;
pub mod maintenance;
pub mod policy;
pub mod run;
pub mod status;

/// Opens the database and rebuilds projections from snapshot + tail.
pub fn open_engine(config: &Config) -> Result<Arc<Engine>> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    let log = EventLog::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    let engine = Engine::new(
        Arc::new(log),
        Arc::new(StandaloneGate::new(0)),
        config.engine_options()?,
    )
    .context("failed to start engine")?;

    let report = engine.restore().context("failed to restore projections")?;
    tracing::debug!(
        snapshot = ?report.snapshot_id,
        replayed = report.replayed,
        "engine ready"
    );
    Ok(Arc::new(engine))
}

pub fn read_policy_file(path: &Path) -> Result<PolicySet> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file {}", path.display()))?;
    PolicySet::from_json(&json).with_context(|| format!("invalid policy file {}", path.display()))
}
