//! The write path: seal, persist, fold, forecast.
//!
//! Every append runs under one mutex so ingest timestamps stay strictly
//! increasing and projections see events in log order. Reads go straight to
//! the projections and never take that lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use ql_core::payload::{
    self, IdentityRegistered, IntentDecided, ObservationSummary, ProviderError,
    ProviderPollObserved, ResetObserved, UsageObserved,
};
use ql_core::projection::{
    DEFAULT_WINDOW, ForecastProjection, GraphProjection, IdentityProjection,
    ProviderStateProjection, UsageProjection,
};
use ql_core::{
    Correlation, DelayController, Dimensions, Event, EventDraft, EventId, EventType, Intent,
    MicroUsd, PolicyEngine, PolicyEvaluationResult, PolicySet, SENTINEL_UNKNOWN,
    SnapshotParticipant, Source,
};
use ql_db::{EventLog, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::forecaster::{DEFAULT_RESET_HORIZON_SECS, Forecaster};
use crate::gate::WriteGate;
use crate::snapshot::{RestoreReport, SnapshotCoordinator};

pub const DEFAULT_WRITER_ID: &str = "ql";
pub const DEFAULT_DELAY_KP: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Stamped as `source.writer_id` on every appended event.
    pub writer_id: String,
    /// Usage points kept per pool for forecasting.
    pub forecast_window: usize,
    pub default_reset_horizon: TimeDelta,
    pub delay_kp: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            writer_id: DEFAULT_WRITER_ID.to_string(),
            forecast_window: DEFAULT_WINDOW,
            default_reset_horizon: TimeDelta::seconds(DEFAULT_RESET_HORIZON_SECS),
            delay_kp: DEFAULT_DELAY_KP,
        }
    }
}

/// The five views folded from the log.
#[derive(Debug, Clone)]
pub struct Projections {
    pub usage: Arc<UsageProjection>,
    pub identities: Arc<IdentityProjection>,
    pub provider_states: Arc<ProviderStateProjection>,
    pub forecast_histories: Arc<ForecastProjection>,
    pub constraint_graph: Arc<GraphProjection>,
}

impl Projections {
    pub fn new(forecast_window: usize) -> Self {
        Self {
            usage: Arc::new(UsageProjection::new()),
            identities: Arc::new(IdentityProjection::new()),
            provider_states: Arc::new(ProviderStateProjection::new()),
            forecast_histories: Arc::new(ForecastProjection::new(forecast_window)),
            constraint_graph: Arc::new(GraphProjection::new()),
        }
    }

    /// Fold order. Usage precedes forecast history so a forecast computed
    /// right after a fold sees the pool's fresh remaining count.
    pub fn participants(&self) -> Vec<Arc<dyn SnapshotParticipant>> {
        vec![
            Arc::clone(&self.usage) as Arc<dyn SnapshotParticipant>,
            Arc::clone(&self.identities) as Arc<dyn SnapshotParticipant>,
            Arc::clone(&self.provider_states) as Arc<dyn SnapshotParticipant>,
            Arc::clone(&self.forecast_histories) as Arc<dyn SnapshotParticipant>,
            Arc::clone(&self.constraint_graph) as Arc<dyn SnapshotParticipant>,
        ]
    }
}

/// One pool's reading from a provider poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolObservation {
    pub pool_id: String,
    pub used: i64,
    pub remaining: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cost: MicroUsd,
}

/// What a provider driver hands back after one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResult {
    pub provider_id: String,
    /// "success", "partial", or "error".
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub usage: Vec<PoolObservation>,
    /// Opaque driver state to keep across restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_blob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_status() -> String {
    "success".to_string()
}

impl PollResult {
    pub fn is_error(&self) -> bool {
        self.status == "error"
    }
}

/// The recorded outcome of [`Engine::submit_intent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentOutcome {
    pub intent_id: String,
    pub event_id: EventId,
    #[serde(flatten)]
    pub result: PolicyEvaluationResult,
}

pub struct Engine {
    log: Arc<EventLog>,
    gate: Arc<dyn WriteGate>,
    writer_id: String,
    projections: Projections,
    participants: Vec<Arc<dyn SnapshotParticipant>>,
    snapshots: SnapshotCoordinator,
    policy: PolicyEngine,
    forecaster: Forecaster,
    /// Last assigned ingest time. Held for the whole of every append.
    write: Mutex<Option<DateTime<Utc>>>,
}

impl Engine {
    pub fn new(
        log: Arc<EventLog>,
        gate: Arc<dyn WriteGate>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let projections = Projections::new(options.forecast_window);
        let participants = projections.participants();
        let last_ingest = log.latest_ingest_time()?;
        Ok(Self {
            snapshots: SnapshotCoordinator::new(Arc::clone(&log), participants.clone()),
            policy: PolicyEngine::new(
                Arc::clone(&projections.usage),
                DelayController::new(options.delay_kp),
            ),
            forecaster: Forecaster::linear(options.default_reset_horizon),
            log,
            gate,
            writer_id: options.writer_id,
            projections,
            participants,
            write: Mutex::new(last_ingest),
        })
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub const fn projections(&self) -> &Projections {
        &self.projections
    }

    pub const fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    pub fn can_write(&self) -> bool {
        self.gate.can_write()
    }

    fn lock(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.write.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validates, persists, and folds one event, then records any forecast
    /// it triggers.
    pub fn append(&self, draft: EventDraft) -> Result<Event, EngineError> {
        let mut last = self.lock();
        let mut events = self.commit(&mut last, vec![draft])?;
        events.pop().ok_or(EngineError::NotFound {
            key: "appended event".into(),
        })
    }

    /// Like [`Engine::append`] for several events that persist atomically.
    pub fn append_batch(&self, drafts: Vec<EventDraft>) -> Result<Vec<Event>, EngineError> {
        let mut last = self.lock();
        self.commit(&mut last, drafts)
    }

    fn commit(
        &self,
        last: &mut Option<DateTime<Utc>>,
        drafts: Vec<EventDraft>,
    ) -> Result<Vec<Event>, EngineError> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_writer()?;
        let events = drafts
            .into_iter()
            .map(|draft| self.seal(draft, last))
            .collect::<Result<Vec<_>, _>>()?;
        self.persist(last, events)
    }

    fn ensure_writer(&self) -> Result<(), EngineError> {
        if self.gate.can_write() {
            Ok(())
        } else {
            Err(EngineError::NotWriter {
                epoch: self.gate.epoch(),
            })
        }
    }

    /// Writes sealed events in one transaction, folds them, then records the
    /// forecasts they trigger.
    fn persist(
        &self,
        last: &mut Option<DateTime<Utc>>,
        events: Vec<Event>,
    ) -> Result<Vec<Event>, EngineError> {
        self.log.append_all(&events)?;

        let mut follow_ups = Vec::new();
        for event in &events {
            self.fold(event)?;
            if let Some(draft) = self.forecaster.on_usage_observed(
                event,
                &self.projections.usage,
                &self.projections.forecast_histories,
            )? {
                follow_ups.push(draft);
            }
        }

        if !follow_ups.is_empty() {
            let forecasts = follow_ups
                .into_iter()
                .map(|draft| self.seal(draft, last))
                .collect::<Result<Vec<_>, _>>()?;
            self.log.append_all(&forecasts)?;
            for event in &forecasts {
                self.fold(event)?;
            }
        }

        Ok(events)
    }

    /// Assigns id, ingest time, writer, and epoch.
    fn seal(&self, mut draft: EventDraft, last: &mut Option<DateTime<Utc>>) -> Result<Event, EngineError> {
        payload::validate(draft.event_type, &draft.payload)?;

        // The log stores microseconds; anything finer would not survive a read.
        let now = Utc::now().trunc_subsecs(6);
        let ts_ingest = match *last {
            Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
            _ => now,
        };

        let event_id = EventId::new(format!(
            "{}_{}",
            draft.event_type,
            Uuid::new_v4().simple()
        ))?;
        draft.source.writer_id.clone_from(&self.writer_id);
        let event = draft.into_event(event_id, ts_ingest, self.gate.epoch());
        event.validate()?;
        *last = Some(ts_ingest);
        Ok(event)
    }

    fn fold(&self, event: &Event) -> Result<(), EngineError> {
        for participant in &self.participants {
            participant.apply_event(event).inspect_err(|err| {
                tracing::warn!(
                    event_id = %event.event_id,
                    projection = participant.name(),
                    error = %err,
                    "persisted event failed to apply"
                );
            })?;
        }
        Ok(())
    }

    /// Records a provider poll.
    ///
    /// An error status yields a single `provider_error`. Otherwise the poll
    /// event and every usage and reset observation it causes are written in
    /// one transaction, poll first.
    pub fn ingest_poll(&self, poll: &PollResult) -> Result<Vec<Event>, EngineError> {
        let source = Source::new("daemon", "poller", &self.writer_id);
        let correlation = Correlation::root(format!(
            "poll_{}_{}",
            poll.provider_id,
            Utc::now().timestamp()
        ));

        if poll.is_error() {
            let payload = serde_json::to_value(ProviderError {
                provider_id: poll.provider_id.clone(),
                status: poll.status.clone(),
                message: poll.error.clone().unwrap_or_else(|| "poll failed".into()),
            })?;
            let draft = EventDraft::new(EventType::ProviderError, poll.timestamp, payload)
                .with_source(source)
                .with_correlation(correlation);
            return Ok(vec![self.append(draft)?]);
        }

        let payload = serde_json::to_value(ProviderPollObserved {
            provider_id: poll.provider_id.clone(),
            status: poll.status.clone(),
            observation_summary: ObservationSummary {
                usage_count: poll.usage.len(),
            },
            state: poll.state_blob.clone(),
        })?;
        let poll_draft = EventDraft::new(EventType::ProviderPollObserved, poll.timestamp, payload)
            .with_source(source.clone())
            .with_correlation(correlation);

        let mut last = self.lock();
        self.ensure_writer()?;
        let poll_event = self.seal(poll_draft, &mut last)?;
        let caused_by = Correlation::caused_by(&poll_event);

        let mut drafts = Vec::with_capacity(poll.usage.len() * 2);
        for obs in &poll.usage {
            let usage = serde_json::to_value(UsageObserved {
                provider_id: poll.provider_id.clone(),
                pool_id: obs.pool_id.clone(),
                used: obs.used,
                remaining: obs.remaining,
                limit: obs.limit,
                cost: obs.cost,
            })?;
            drafts.push(
                EventDraft::new(EventType::UsageObserved, poll.timestamp, usage)
                    .with_source(source.clone())
                    .with_correlation(caused_by.clone()),
            );
            if let Some(reset_at) = obs.reset_at {
                let reset = serde_json::to_value(ResetObserved {
                    provider_id: poll.provider_id.clone(),
                    pool_id: obs.pool_id.clone(),
                    reset_at,
                })?;
                drafts.push(
                    EventDraft::new(EventType::ResetObserved, poll.timestamp, reset)
                        .with_source(source.clone())
                        .with_correlation(caused_by.clone()),
                );
            }
        }
        let mut sealed = Vec::with_capacity(drafts.len() + 1);
        sealed.push(poll_event);
        for draft in drafts {
            sealed.push(self.seal(draft, &mut last)?);
        }
        let events = self.persist(&mut last, sealed)?;

        tracing::debug!(
            provider_id = %poll.provider_id,
            events = events.len(),
            "ingested poll"
        );
        Ok(events)
    }

    /// Evaluates `intent` and records the decision as `intent_decided`.
    ///
    /// Blank dimensions are recorded as `sentinel:unknown`; a blank intent id
    /// is generated.
    pub fn submit_intent(&self, intent: &Intent) -> Result<IntentOutcome, EngineError> {
        let mut intent = intent.clone();
        if intent.intent_id.trim().is_empty() {
            intent.intent_id = format!("intent_{}", Uuid::new_v4().simple());
        }
        for dim in [
            &mut intent.agent_id,
            &mut intent.identity_id,
            &mut intent.workload_id,
            &mut intent.scope_id,
        ] {
            if dim.trim().is_empty() {
                *dim = SENTINEL_UNKNOWN.to_string();
            }
        }

        let now = Utc::now();
        let result = self.policy.evaluate_at(&intent, now);
        let payload = serde_json::to_value(IntentDecided {
            intent_id: intent.intent_id.clone(),
            provider_id: intent.provider_id.clone(),
            pool_id: intent.pool_id.clone(),
            expected_cost: intent.expected_cost,
            decision: result.decision,
            reason: result.reason.clone(),
            wait_seconds: result.modifications.wait_seconds,
            warnings: result.warnings.clone(),
        })?;
        let draft = EventDraft::new(EventType::IntentDecided, now, payload)
            .with_source(Source::new("api", "intent", &self.writer_id))
            .with_dimensions(Dimensions {
                agent_id: intent.agent_id,
                identity_id: intent.identity_id,
                workload_id: intent.workload_id,
                scope_id: intent.scope_id,
            })
            .with_correlation(Correlation::root(intent.intent_id.clone()));
        let event = self.append(draft)?;

        tracing::info!(
            intent_id = %intent.intent_id,
            decision = result.decision.as_str(),
            reason = %result.reason,
            "intent decided"
        );
        Ok(IntentOutcome {
            intent_id: intent.intent_id,
            event_id: event.event_id,
            result,
        })
    }

    pub fn register_identity(
        &self,
        identity_id: &str,
        kind: &str,
        metadata: BTreeMap<String, Value>,
        token_hash: Option<String>,
    ) -> Result<Event, EngineError> {
        let payload = serde_json::to_value(IdentityRegistered {
            kind: kind.to_string(),
            metadata,
            token_hash,
        })?;
        self.append(
            EventDraft::new(EventType::IdentityRegistered, Utc::now(), payload)
                .with_source(Source::new("api", "identity", &self.writer_id))
                .with_dimensions(Dimensions::for_identity(identity_id))
                .with_correlation(Correlation::root(format!("identity_{identity_id}"))),
        )
    }

    /// Fails with [`EngineError::NotFound`] for identities never registered.
    pub fn delete_identity(&self, identity_id: &str) -> Result<Event, EngineError> {
        if self.projections.identities.get(identity_id).is_none() {
            return Err(EngineError::NotFound {
                key: format!("identity {identity_id}"),
            });
        }
        self.append(
            EventDraft::new(EventType::IdentityDeleted, Utc::now(), Value::Object(serde_json::Map::new()))
                .with_source(Source::new("api", "identity", &self.writer_id))
                .with_dimensions(Dimensions::for_identity(identity_id))
                .with_correlation(Correlation::root(format!("identity_{identity_id}"))),
        )
    }

    /// Records the document as `policy_updated`, then makes it active.
    pub fn load_policies(&self, set: PolicySet) -> Result<Event, EngineError> {
        let payload = serde_json::to_value(set.config())?;
        let event = self.append(
            EventDraft::new(EventType::PolicyUpdated, Utc::now(), payload)
                .with_source(Source::new("daemon", "policy_loader", &self.writer_id)),
        )?;
        self.policy.load(set);
        Ok(event)
    }

    pub fn evaluate(&self, intent: &Intent) -> PolicyEvaluationResult {
        self.policy.evaluate(intent)
    }

    /// Checkpoints all projections. No append can interleave.
    pub fn take_snapshot(&self, now: DateTime<Utc>) -> Result<Snapshot, EngineError> {
        let _write = self.lock();
        self.snapshots.take_snapshot(now)
    }

    /// Rebuilds every projection from the newest snapshot plus the log tail.
    pub fn restore(&self) -> Result<RestoreReport, EngineError> {
        let mut last = self.lock();
        let report = self.snapshots.restore()?;
        let latest = self.log.latest_ingest_time()?;
        *last = (*last).max(latest);
        Ok(report)
    }
}
