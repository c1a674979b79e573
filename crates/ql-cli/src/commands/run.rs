//! Run command: keep the engine's background workers going until Ctrl-C.
//!
//! On Unix, SIGHUP re-reads the policy file without restarting the workers.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use ql_engine::{Engine, spawn_workers};
use tokio_util::sync::CancellationToken;

use crate::Config;
use crate::commands::read_policy_file;

pub fn run(engine: &Arc<Engine>, config: &Config) -> Result<()> {
    reload_policies(engine, config)?;
    let settings = config.worker_settings()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async {
        let cancel = CancellationToken::new();
        let handles = spawn_workers(engine, settings, &cancel);
        tracing::info!(workers = handles.len(), writer = engine.writer_id(), "ledger running");

        wait_for_shutdown(engine, config).await?;
        tracing::info!("shutting down");
        cancel.cancel();

        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "worker exited abnormally");
            }
        }

        match engine.take_snapshot(Utc::now()) {
            Ok(snapshot) => tracing::info!(snapshot_id = %snapshot.snapshot_id, "final snapshot saved"),
            Err(err) if err.is_expected_skip() => tracing::info!(reason = %err, "no final snapshot"),
            Err(err) => tracing::warn!(error = %err, "final snapshot failed"),
        }
        Ok(())
    })
}

/// Reads the configured policy file, records it and makes it active.
///
/// Returns `false` when no policy file is configured. On error the
/// previously active set stays in force.
pub fn reload_policies(engine: &Engine, config: &Config) -> Result<bool> {
    let Some(path) = &config.policy_path else {
        return Ok(false);
    };
    let set = read_policy_file(path)?;
    engine.load_policies(set).context("failed to record policy update")?;
    Ok(true)
}

#[cfg(unix)]
async fn wait_for_shutdown(engine: &Engine, config: &Config) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => return result.context("failed to listen for Ctrl-C"),
            _ = hangup.recv() => match reload_policies(engine, config) {
                Ok(true) => tracing::info!("policies reloaded"),
                Ok(false) => tracing::info!("no policy file configured, nothing to reload"),
                Err(err) => tracing::warn!(error = %format!("{err:#}"), "policy reload failed, keeping active policies"),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_engine: &Engine, _config: &Config) -> Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")
}
