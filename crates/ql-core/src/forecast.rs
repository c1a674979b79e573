//! Exhaustion forecasting from usage history.
//!
//! [`LinearModel`] fits `used` and `cost` against elapsed seconds with
//! ordinary least squares and turns the slope into time-to-exhaustion
//! percentiles and a binary exhaustion-before-reset risk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::currency::MicroUsd;

/// Unit label for usage burn rates.
pub const USAGE_RATE_UNIT: &str = "per_second";
/// Unit label for cost burn rates.
pub const COST_RATE_UNIT: &str = "micro_usd/s";

const P90_Z: f64 = 1.645;
const P99_Z: f64 = 2.0;

/// Reasons a forecast cannot be produced this cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForecastError {
    #[error("insufficient history: need at least 2 points, have {points}")]
    InsufficientHistory { points: usize },
    #[error("degenerate history: all {points} points share one timestamp")]
    DegenerateHistory { points: usize },
}

/// One observation in a pool's usage history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePoint {
    pub timestamp: DateTime<Utc>,
    pub used: i64,
    pub remaining: i64,
    #[serde(default)]
    pub cost: MicroUsd,
}

/// Time-to-exhaustion estimates in whole seconds.
///
/// `i64::MAX` means the pool is not being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeToExhaustion {
    pub p50_seconds: i64,
    pub p90_seconds: i64,
    pub p99_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurnRate {
    pub mean: f64,
    pub variance: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Risk {
    pub probability_exhaustion_before_reset: f64,
    pub safety_margin_seconds: i64,
    pub ttr_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub tte: TimeToExhaustion,
    pub risk: Risk,
    pub burn_rate: BurnRate,
    pub cost_burn_rate: BurnRate,
}

/// A prediction strategy over a pool's usage history.
pub trait ForecastModel: Send + Sync {
    fn predict(
        &self,
        history: &[UsagePoint],
        current_remaining: i64,
        reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Forecast, ForecastError>;
}

/// Least-squares linear burn-rate model.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearModel;

struct Fit {
    slope: f64,
    variance: f64,
}

#[expect(
    clippy::cast_precision_loss,
    reason = "usage counters and history lengths stay far below 2^53"
)]
fn fit(xs: &[f64], ys: impl Iterator<Item = f64> + Clone) -> Option<Fit> {
    let n = xs.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for (x, y) in xs.iter().zip(ys.clone()) {
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denom = n.mul_add(sum_xx, -(sum_x * sum_x));
    if denom == 0.0 {
        return None;
    }
    let slope = n.mul_add(sum_xy, -(sum_x * sum_y)) / denom;
    let intercept = slope.mul_add(-sum_x, sum_y) / n;

    let variance = if xs.len() > 2 {
        let ssr: f64 = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| {
                let residual = y - slope.mul_add(*x, intercept);
                residual * residual
            })
            .sum();
        ssr / (n - 2.0)
    } else {
        0.0
    };

    Some(Fit { slope, variance })
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    reason = "seconds to exhaustion are truncated toward zero and saturate at i64::MAX"
)]
fn seconds_to_exhaustion(remaining: i64, rate: f64) -> i64 {
    (remaining as f64 / rate) as i64
}

impl ForecastModel for LinearModel {
    #[expect(
        clippy::cast_precision_loss,
        reason = "elapsed milliseconds and usage counters stay far below 2^53"
    )]
    fn predict(
        &self,
        history: &[UsagePoint],
        current_remaining: i64,
        reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Forecast, ForecastError> {
        let points = history.len();
        let Some(first) = history.first() else {
            return Err(ForecastError::InsufficientHistory { points });
        };
        if points < 2 {
            return Err(ForecastError::InsufficientHistory { points });
        }

        let start = first.timestamp;
        let xs: Vec<f64> = history
            .iter()
            .map(|p| (p.timestamp - start).num_milliseconds() as f64 / 1000.0)
            .collect();

        let usage = fit(&xs, history.iter().map(|p| p.used as f64))
            .ok_or(ForecastError::DegenerateHistory { points })?;
        let cost = fit(&xs, history.iter().map(|p| p.cost.as_f64()))
            .ok_or(ForecastError::DegenerateHistory { points })?;

        let ttr_seconds = (reset_at - now).num_seconds();
        let cost_burn_rate = BurnRate {
            mean: cost.slope,
            variance: cost.variance,
            unit: COST_RATE_UNIT.to_string(),
        };

        if usage.slope <= 0.0 {
            return Ok(Forecast {
                tte: TimeToExhaustion {
                    p50_seconds: i64::MAX,
                    p90_seconds: i64::MAX,
                    p99_seconds: i64::MAX,
                },
                risk: Risk {
                    probability_exhaustion_before_reset: 0.0,
                    safety_margin_seconds: i64::MAX,
                    ttr_seconds,
                },
                burn_rate: BurnRate {
                    mean: usage.slope,
                    variance: 0.0,
                    unit: USAGE_RATE_UNIT.to_string(),
                },
                cost_burn_rate,
            });
        }

        let std_dev = usage.variance.sqrt();
        let p50 = seconds_to_exhaustion(current_remaining, usage.slope);
        let p90 = seconds_to_exhaustion(current_remaining, P90_Z.mul_add(std_dev, usage.slope));
        let p99 = seconds_to_exhaustion(current_remaining, P99_Z.mul_add(std_dev, usage.slope));

        let safety_margin_seconds = p99.saturating_sub(ttr_seconds);
        let probability = if safety_margin_seconds < 0 { 1.0 } else { 0.0 };

        Ok(Forecast {
            tte: TimeToExhaustion {
                p50_seconds: p50,
                p90_seconds: p90,
                p99_seconds: p99,
            },
            risk: Risk {
                probability_exhaustion_before_reset: probability,
                safety_margin_seconds,
                ttr_seconds,
            },
            burn_rate: BurnRate {
                mean: usage.slope,
                variance: usage.variance,
                unit: USAGE_RATE_UNIT.to_string(),
            },
            cost_burn_rate,
        })
    }
}
