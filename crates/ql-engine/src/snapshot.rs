//! Cross-projection checkpoints and the restore path.
//!
//! Projections advance independently, so a checkpoint records the oldest
//! cursor among them: every projection has applied at least that far.
//! Restore loads each view, then replays the log tail after the boundary,
//! skipping events a projection had already applied when it was exported.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ql_core::projection::ExportedState;
use ql_core::{Cursor, SnapshotId, SnapshotParticipant};
use ql_db::{DbError, EventLog, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Events read per page during tail replay.
pub const REPLAY_BATCH: usize = 1000;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotPayload {
    projections: BTreeMap<String, ProjectionEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProjectionEntry {
    cursor: Option<Cursor>,
    view: Value,
}

/// What a restore did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// The snapshot loaded, if any existed.
    pub snapshot_id: Option<SnapshotId>,
    /// Tail events read after the boundary.
    pub replayed: usize,
}

pub struct SnapshotCoordinator {
    log: Arc<EventLog>,
    participants: Vec<Arc<dyn SnapshotParticipant>>,
}

impl SnapshotCoordinator {
    pub fn new(log: Arc<EventLog>, participants: Vec<Arc<dyn SnapshotParticipant>>) -> Self {
        Self { log, participants }
    }

    /// Persists a checkpoint whose boundary is the oldest participant cursor.
    ///
    /// Fails with [`EngineError::IncompleteState`] while any participant has
    /// yet to apply an event.
    pub fn take_snapshot(&self, now: DateTime<Utc>) -> Result<Snapshot, EngineError> {
        let mut projections = BTreeMap::new();
        let mut oldest: Option<Cursor> = None;

        for participant in &self.participants {
            let ExportedState { cursor, view } = participant.export()?;
            let Some(current) = cursor.clone() else {
                return Err(EngineError::IncompleteState {
                    projection: participant.name(),
                });
            };
            if oldest
                .as_ref()
                .is_none_or(|o| current.ts_ingest < o.ts_ingest)
            {
                oldest = Some(current);
            }
            projections.insert(participant.name().to_string(), ProjectionEntry { cursor, view });
        }

        let boundary = oldest.ok_or(EngineError::IncompleteState { projection: "none" })?;
        let snapshot = Snapshot {
            snapshot_id: SnapshotId::new(format!("snap_{}", Uuid::new_v4().simple()))?,
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            ts_snapshot: now,
            last_event_id: boundary.event_id,
            payload: serde_json::to_value(SnapshotPayload { projections })?,
        };
        self.log.save_snapshot(&snapshot)?;
        tracing::info!(
            snapshot_id = %snapshot.snapshot_id,
            last_event_id = %snapshot.last_event_id,
            "saved snapshot"
        );
        Ok(snapshot)
    }

    /// Loads the newest snapshot into every participant.
    ///
    /// Returns the snapshot id, the boundary ingest time to replay from, and
    /// each participant's restored cursor time in participant order.
    fn load_latest(&self) -> Result<Option<(SnapshotId, DateTime<Utc>, Vec<Option<DateTime<Utc>>>)>, EngineError> {
        let Some(snapshot) = self.log.latest_snapshot()? else {
            return Ok(None);
        };
        let boundary = self
            .log
            .get_event(snapshot.last_event_id.as_str())?
            .ok_or_else(|| DbError::NotFound {
                key: snapshot.last_event_id.to_string(),
            })?;

        let mut payload: SnapshotPayload = serde_json::from_value(snapshot.payload)?;
        let mut cursors = Vec::with_capacity(self.participants.len());
        for participant in &self.participants {
            let entry = payload
                .projections
                .remove(participant.name())
                .ok_or(EngineError::IncompleteState {
                    projection: participant.name(),
                })?;
            cursors.push(entry.cursor.as_ref().map(|c| c.ts_ingest));
            participant.import(entry.cursor, entry.view)?;
        }
        Ok(Some((snapshot.snapshot_id, boundary.ts_ingest, cursors)))
    }

    /// Snapshot load followed by tail replay. Any apply failure is fatal.
    ///
    /// Without a snapshot the whole log is replayed into the participants
    /// as they are.
    pub fn restore(&self) -> Result<RestoreReport, EngineError> {
        let (snapshot_id, mut since, cursors) = match self.load_latest()? {
            Some((id, boundary, cursors)) => (Some(id), Some(boundary), cursors),
            None => (None, None, vec![None; self.participants.len()]),
        };

        let mut replayed = 0;
        loop {
            let events = self.log.read_events(since, REPLAY_BATCH)?;
            let Some(last) = events.last() else {
                break;
            };
            since = Some(last.ts_ingest);

            for event in &events {
                for (participant, cursor) in self.participants.iter().zip(&cursors) {
                    if cursor.is_some_and(|seen| event.ts_ingest <= seen) {
                        continue;
                    }
                    participant
                        .apply_event(event)
                        .map_err(|source| EngineError::Replay {
                            event_id: event.event_id.to_string(),
                            source,
                        })?;
                }
            }
            replayed += events.len();
        }

        tracing::info!(
            snapshot_id = ?snapshot_id.as_ref().map(SnapshotId::as_str),
            replayed,
            "restored projections"
        );
        Ok(RestoreReport {
            snapshot_id,
            replayed,
        })
    }
}
