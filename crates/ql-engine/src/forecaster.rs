//! Turns each applied usage observation into a `forecast_computed` event.

use chrono::{DateTime, TimeDelta, Utc};
use ql_core::payload::{ForecastComputed, UsageObserved};
use ql_core::projection::{ForecastProjection, UsageProjection};
use ql_core::{Correlation, Event, EventDraft, EventType, ForecastModel, LinearModel, Source};

use crate::error::EngineError;

/// Reset horizon assumed for pools that have never reported one.
pub const DEFAULT_RESET_HORIZON_SECS: i64 = 3600;

pub struct Forecaster {
    model: Box<dyn ForecastModel>,
    default_reset_horizon: TimeDelta,
}

impl Forecaster {
    pub fn new(model: Box<dyn ForecastModel>, default_reset_horizon: TimeDelta) -> Self {
        Self {
            model,
            default_reset_horizon,
        }
    }

    pub fn linear(default_reset_horizon: TimeDelta) -> Self {
        Self::new(Box::new(LinearModel), default_reset_horizon)
    }

    /// The follow-up draft for an applied `usage_observed` event, or `None`
    /// when the pool's history cannot support a forecast yet.
    ///
    /// Must run after `event` has been folded into both projections.
    pub fn on_usage_observed(
        &self,
        event: &Event,
        usage: &UsageProjection,
        history: &ForecastProjection,
    ) -> Result<Option<EventDraft>, EngineError> {
        if event.event_type != EventType::UsageObserved {
            return Ok(None);
        }
        let observed: UsageObserved = event.decode_payload()?;
        let now = event.ts_event;
        let points = history.history(&observed.provider_id, &observed.pool_id);
        let pool = usage.pool(&observed.provider_id, &observed.pool_id);
        let remaining = pool.as_ref().map_or(observed.remaining, |p| p.remaining);
        let reset_at = reset_at_or_horizon(
            pool.and_then(|p| p.reset_at),
            now,
            self.default_reset_horizon,
        );

        let forecast = match self.model.predict(&points, remaining, reset_at, now) {
            Ok(forecast) => forecast,
            Err(err) => {
                tracing::debug!(
                    provider_id = %observed.provider_id,
                    pool_id = %observed.pool_id,
                    error = %err,
                    "skipping forecast"
                );
                return Ok(None);
            }
        };

        let payload = serde_json::to_value(ForecastComputed {
            provider_id: observed.provider_id,
            pool_id: observed.pool_id,
            forecast,
        })?;
        Ok(Some(
            EventDraft::new(EventType::ForecastComputed, now, payload)
                .with_source(Source::new("daemon", "forecaster", &event.source.writer_id))
                .with_dimensions(event.dimensions.clone())
                .with_correlation(Correlation::caused_by(event)),
        ))
    }
}

fn reset_at_or_horizon(
    reset_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    horizon: TimeDelta,
) -> DateTime<Utc> {
    reset_at.filter(|at| *at > now).unwrap_or(now + horizon)
}
