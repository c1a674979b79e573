//! Periodic background jobs: snapshot, prune, archive, and rollup.
//!
//! Each worker is a tokio task ticking on its own interval. The job body
//! runs on the blocking pool since every job talks to SQLite. A failed tick
//! is logged and retried on the next one; cancellation is checked between
//! ticks, so a job that has started always finishes its current batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::archive::{Archiver, BlobSink};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::retention::RetentionPolicy;
use crate::rollup::rollup_batch;

pub struct PruneSettings {
    pub interval: Duration,
    pub policy: RetentionPolicy,
}

pub struct ArchiveSettings {
    pub interval: Duration,
    pub sink: Arc<dyn BlobSink>,
    /// Events younger than this stay in the log.
    pub retention: TimeDelta,
    pub batch_size: usize,
}

pub struct RollupSettings {
    pub interval: Duration,
    pub batch_size: usize,
}

pub struct WorkerSettings {
    pub snapshot_interval: Duration,
    pub prune: Option<PruneSettings>,
    pub archive: Option<ArchiveSettings>,
    pub rollup: Option<RollupSettings>,
}

/// Starts every configured worker. Each handle resolves once `cancel` fires.
pub fn spawn_workers(
    engine: &Arc<Engine>,
    settings: WorkerSettings,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let snapshots = Arc::clone(engine);
    handles.push(tokio::spawn(run_periodic(
        "snapshot",
        settings.snapshot_interval,
        cancel.clone(),
        move || snapshots.take_snapshot(Utc::now()).map(|_| 1),
    )));

    if let Some(prune) = settings.prune {
        let engine = Arc::clone(engine);
        handles.push(tokio::spawn(run_periodic(
            "prune",
            prune.interval,
            cancel.clone(),
            move || prune.policy.prune(engine.log(), Utc::now()),
        )));
    }

    if let Some(archive) = settings.archive {
        let archiver = Archiver::new(
            Arc::clone(engine.log()),
            archive.sink,
            archive.retention,
            archive.batch_size,
        );
        handles.push(tokio::spawn(run_periodic(
            "archive",
            archive.interval,
            cancel.clone(),
            move || archiver.archive_batch(Utc::now()),
        )));
    }

    if let Some(rollup) = settings.rollup {
        let engine = Arc::clone(engine);
        let stop = cancel.clone();
        let batch_size = rollup.batch_size.max(1);
        handles.push(tokio::spawn(run_periodic(
            "rollup",
            rollup.interval,
            cancel.clone(),
            move || {
                let mut total = 0;
                loop {
                    let read = rollup_batch(engine.log(), batch_size)?;
                    total += read;
                    if read < batch_size || stop.is_cancelled() {
                        return Ok(total);
                    }
                }
            },
        )));
    }

    handles
}

/// Runs `job` every `period` until `cancel` fires. The first run happens one
/// full period after start.
pub async fn run_periodic<F>(name: &'static str, period: Duration, cancel: CancellationToken, job: F)
where
    F: Fn() -> Result<usize, EngineError> + Send + Sync + 'static,
{
    let job = Arc::new(job);
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    tracing::debug!(worker = name, ?period, "worker started");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let job = Arc::clone(&job);
        match tokio::task::spawn_blocking(move || job()).await {
            Ok(Ok(0)) => {}
            Ok(Ok(count)) => tracing::debug!(worker = name, count, "worker tick done"),
            Ok(Err(err)) if err.is_expected_skip() => {
                tracing::info!(worker = name, reason = %err, "worker tick skipped");
            }
            Ok(Err(err)) => tracing::warn!(worker = name, error = %err, "worker tick failed"),
            Err(err) => tracing::error!(worker = name, error = %err, "worker tick panicked"),
        }
    }

    tracing::info!(worker = name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::DateTime;
    use ql_core::{EventDraft, EventType};
    use ql_db::EventLog;
    use serde_json::json;

    use super::*;
    use crate::engine::EngineOptions;
    use crate::gate::StandaloneGate;

    const PATIENCE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn cancellation_stops_an_idle_worker() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_periodic("idle", Duration::from_secs(3600), cancel.clone(), || Ok(0)));

        cancel.cancel();
        tokio::time::timeout(PATIENCE, handle)
            .await
            .expect("worker exits promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn failing_ticks_keep_the_worker_alive() {
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = tokio::spawn(run_periodic("flaky", Duration::from_millis(5), cancel.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::NotFound { key: "nothing".into() })
        }));

        tokio::time::timeout(PATIENCE, async {
            while ticks.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker keeps ticking");

        cancel.cancel();
        tokio::time::timeout(PATIENCE, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn snapshot_and_rollup_workers_run() {
        let log = Arc::new(EventLog::open_in_memory().expect("open in-memory db"));
        let engine = Arc::new(
            Engine::new(Arc::clone(&log), Arc::new(StandaloneGate::new(0)), EngineOptions::default()).unwrap(),
        );
        // Touch every projection so a snapshot is possible.
        engine
            .append(EventDraft::new(
                EventType::UsageObserved,
                DateTime::UNIX_EPOCH,
                json!({"provider_id": "p", "pool_id": "q", "used": 1, "remaining": 9}),
            ))
            .unwrap();

        let cancel = CancellationToken::new();
        let handles = spawn_workers(
            &engine,
            WorkerSettings {
                snapshot_interval: Duration::from_millis(5),
                prune: None,
                archive: None,
                rollup: Some(RollupSettings {
                    interval: Duration::from_millis(5),
                    batch_size: 10,
                }),
            },
            &cancel,
        );

        tokio::time::timeout(PATIENCE, async {
            while log.snapshot_count().unwrap() == 0
                || log.get_system_state(crate::rollup::ROLLUP_HWM_KEY).is_err()
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("workers make progress");

        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(PATIENCE, handle).await.unwrap().unwrap();
        }
    }
}
