//! Core domain logic for the quota ledger.
//!
//! This crate contains the fundamental types and logic for:
//! - Events: the immutable envelope, typed payloads, and validation
//! - Projections: usage, identity, provider state, forecast history, and the
//!   constraint graph, all folded from the event log
//! - Forecasting: least-squares burn rate and time-to-exhaustion
//! - Policy: the condition language, time windows, and intent evaluation
//!
//! Nothing here performs I/O; storage lives in `ql-db`.

pub mod condition;
pub mod controller;
pub mod currency;
pub mod event;
pub mod event_type;
pub mod forecast;
pub mod payload;
pub mod policy;
pub mod policy_engine;
pub mod projection;
pub mod types;
pub mod window;

pub use controller::DelayController;
pub use currency::MicroUsd;
pub use event::{
    Correlation, Dimensions, Event, EventDraft, SENTINEL_GLOBAL, SENTINEL_SYSTEM,
    SENTINEL_UNKNOWN, Source,
};
pub use event_type::{EventType, UnknownEventType};
pub use forecast::{Forecast, ForecastError, ForecastModel, LinearModel, UsagePoint};
pub use policy::{PolicyConfig, PolicyError, PolicySet};
pub use policy_engine::{Decision, Intent, PolicyEngine, PolicyEvaluationResult};
pub use projection::{Cursor, Projection, ProjectionError, ProjectionState, SnapshotParticipant};
pub use types::{EventId, PoolKey, SnapshotId, ValidationError};
pub use window::{TimeWindow, TimeWindowError};
