//! Orchestration for the quota ledger.
//!
//! - [`Engine`]: the single write path (validate, persist, fold, forecast)
//!   plus poll ingestion, intent decisions, and identity/policy emitters
//! - [`SnapshotCoordinator`]: cross-projection checkpoints and restore
//! - Workers: periodic snapshot, prune, archive, and rollup tasks

pub mod archive;
mod engine;
mod error;
mod forecaster;
pub mod gate;
pub mod retention;
pub mod rollup;
mod snapshot;
pub mod workers;

pub use archive::{ArchiveError, Archiver, BlobSink, LocalDirSink};
pub use engine::{
    DEFAULT_DELAY_KP, DEFAULT_WRITER_ID, Engine, EngineOptions, IntentOutcome, PollResult,
    PoolObservation, Projections,
};
pub use error::EngineError;
pub use forecaster::{DEFAULT_RESET_HORIZON_SECS, Forecaster};
pub use gate::{LeaseGate, StandaloneGate, WriteGate};
pub use retention::RetentionPolicy;
pub use snapshot::{RestoreReport, SNAPSHOT_SCHEMA_VERSION, SnapshotCoordinator};
pub use workers::{ArchiveSettings, PruneSettings, RollupSettings, WorkerSettings, spawn_workers};
