//! Cold-event archival: gzip JSON-lines batches written to a blob sink
//! before the source rows are deleted.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use ql_core::Event;
use ql_db::EventLog;
use thiserror::Error;
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to write archive blob {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode event {event_id}: {source}")]
    Encode {
        event_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to compress archive batch: {0}")]
    Compress(#[source] io::Error),
}

/// Where archived batches go. A `put` must be durable when it returns.
pub trait BlobSink: Send + Sync {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), ArchiveError>;
}

/// Writes blobs under a local directory, creating parents as needed.
#[derive(Debug, Clone)]
pub struct LocalDirSink {
    root: PathBuf,
}

impl LocalDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobSink for LocalDirSink {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), ArchiveError> {
        let path = self.root.join(key);
        let io_err = |source| ArchiveError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        // Write then rename so a crash never leaves a truncated blob under the final key.
        let partial = path.with_extension("partial");
        let mut file = fs::File::create(&partial).map_err(io_err)?;
        file.write_all(data).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&partial, &path).map_err(io_err)?;
        Ok(())
    }
}

/// One JSON object per line, gzip-compressed.
pub fn encode_batch(events: &[Event]) -> Result<Vec<u8>, ArchiveError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        serde_json::to_writer(&mut encoder, event).map_err(|source| ArchiveError::Encode {
            event_id: event.event_id.to_string(),
            source,
        })?;
        encoder.write_all(b"\n").map_err(ArchiveError::Compress)?;
    }
    encoder.finish().map_err(ArchiveError::Compress)
}

/// `events/YYYY/MM/DD/<first>_<last>_<uuid>.jsonl.gz`, dated by the first event.
pub fn batch_key(first: DateTime<Utc>, last: DateTime<Utc>) -> String {
    format!(
        "events/{}/{}_{}_{}.jsonl.gz",
        first.format("%Y/%m/%d"),
        first.timestamp(),
        last.timestamp(),
        Uuid::new_v4().simple()
    )
}

pub struct Archiver {
    log: Arc<EventLog>,
    sink: Arc<dyn BlobSink>,
    retention: TimeDelta,
    batch_size: usize,
}

impl Archiver {
    pub fn new(log: Arc<EventLog>, sink: Arc<dyn BlobSink>, retention: TimeDelta, batch_size: usize) -> Self {
        Self {
            log,
            sink,
            retention,
            batch_size,
        }
    }

    /// Archives and deletes one batch of events older than the retention
    /// window, never past the latest snapshot boundary.
    ///
    /// Returns the number of events removed from the log. Nothing is
    /// deleted unless the blob write succeeded.
    pub fn archive_batch(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let cutoff = self.log.safe_cutoff(now - self.retention)?;
        let events = self.log.read_candidate_events(cutoff, self.batch_size)?;
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Ok(0);
        };

        let key = batch_key(first.ts_ingest, last.ts_ingest);
        let data = encode_batch(&events)?;
        self.sink.put(&key, &data)?;

        let ids: Vec<_> = events.iter().map(|e| e.event_id.clone()).collect();
        let deleted = self.log.delete_events(&ids)?;
        tracing::info!(key = %key, archived = events.len(), deleted, "archived event batch");
        Ok(deleted)
    }
}
