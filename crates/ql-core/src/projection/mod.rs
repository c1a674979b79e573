//! Materialized views folded from the event log.
//!
//! Every projection owns its state behind a single `RwLock` and exposes it
//! only through [`Projection`]: `apply` takes the write side, everything
//! else takes the read side and returns owned copies. Projections advance
//! their cursor on every event, including ones they ignore, so the cursor
//! always names the last event the projection has seen.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::event::Event;
use crate::types::{EventId, ValidationError};

mod forecast_history;
mod graph;
mod identity;
mod provider_state;
mod usage;

pub use forecast_history::{DEFAULT_WINDOW, ForecastProjection, PoolHistory};
pub use graph::{ConstraintGraph, Edge, EdgeType, GraphProjection, Node, NodeType, node_key};
pub use identity::{Identity, IdentityProjection};
pub use provider_state::ProviderStateProjection;
pub use usage::{PoolState, UsageProjection};

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// An event payload did not decode for its declared type.
    #[error(transparent)]
    Payload(#[from] ValidationError),
    #[error("failed to encode {projection} view: {source}")]
    Encode {
        projection: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {projection} view: {source}")]
    Decode {
        projection: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// The last event a projection has applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub event_id: EventId,
    pub ts_ingest: DateTime<Utc>,
}

impl Cursor {
    pub fn of(event: &Event) -> Self {
        Self {
            event_id: event.event_id.clone(),
            ts_ingest: event.ts_ingest,
        }
    }
}

/// A consistent (cursor, view) pair read under one lock acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionState<V> {
    pub cursor: Option<Cursor>,
    pub view: V,
}

/// The fold contract shared by all projections.
pub trait Projection: Send + Sync {
    type View: Serialize + DeserializeOwned;

    /// Stable name, used as the key of this projection's view in snapshots.
    const NAME: &'static str;

    /// Folds one event. Unknown event types are a successful no-op.
    fn apply(&self, event: &Event) -> Result<(), ProjectionError>;

    fn state(&self) -> ProjectionState<Self::View>;

    /// Replaces all state, rebuilding any derived indexes.
    fn load_state(&self, cursor: Option<Cursor>, view: Self::View);

    /// Applies `events` in order, stopping at the first failure.
    fn replay<'a, I>(&self, events: I) -> Result<(), ProjectionError>
    where
        I: IntoIterator<Item = &'a Event>,
        Self: Sized,
    {
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }
}

/// A projection's exported state with its view in serialized form.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedState {
    pub cursor: Option<Cursor>,
    pub view: Value,
}

/// Object-safe face of [`Projection`] used by snapshotting and restore.
pub trait SnapshotParticipant: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply_event(&self, event: &Event) -> Result<(), ProjectionError>;
    fn export(&self) -> Result<ExportedState, ProjectionError>;
    fn import(&self, cursor: Option<Cursor>, view: Value) -> Result<(), ProjectionError>;
}

impl<P: Projection> SnapshotParticipant for P {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn apply_event(&self, event: &Event) -> Result<(), ProjectionError> {
        self.apply(event)
    }

    fn export(&self) -> Result<ExportedState, ProjectionError> {
        let ProjectionState { cursor, view } = self.state();
        let view = serde_json::to_value(view).map_err(|source| ProjectionError::Encode {
            projection: P::NAME,
            source,
        })?;
        Ok(ExportedState { cursor, view })
    }

    fn import(&self, cursor: Option<Cursor>, view: Value) -> Result<(), ProjectionError> {
        let view = serde_json::from_value(view).map_err(|source| ProjectionError::Decode {
            projection: P::NAME,
            source,
        })?;
        self.load_state(cursor, view);
        Ok(())
    }
}

/// Cursor plus data, guarded together so readers never see one without the other.
#[derive(Debug, Default)]
pub(crate) struct Guarded<T> {
    pub cursor: Option<Cursor>,
    pub data: T,
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
