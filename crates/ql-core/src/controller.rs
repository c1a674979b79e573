//! Proportional delay suggestions.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::projection::PoolState;

/// Upper bound on any suggested wait.
pub const MAX_WAIT_SECONDS: f64 = 30.0;

/// Suggests how long a caller should wait so that a pool's current burn
/// rate drifts back toward the rate that would just last until reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayController {
    kp: f64,
}

impl DelayController {
    pub const fn new(kp: f64) -> Self {
        Self { kp }
    }

    pub const fn kp(&self) -> f64 {
        self.kp
    }

    /// Computes the wait for `pool` at `now`.
    ///
    /// Returns zero when the pool has no forecast, has already reset, or is
    /// burning at or below target. A positive `kp_override` replaces the
    /// configured gain for this call.
    #[expect(
        clippy::cast_precision_loss,
        reason = "remaining quota and milliseconds to reset stay far below 2^53"
    )]
    pub fn calculate_wait(
        &self,
        pool: &PoolState,
        now: DateTime<Utc>,
        kp_override: Option<f64>,
    ) -> Duration {
        let (Some(forecast), Some(reset_at)) = (&pool.latest_forecast, pool.reset_at) else {
            return Duration::ZERO;
        };
        let seconds_to_reset = (reset_at - now).num_milliseconds() as f64 / 1000.0;
        if seconds_to_reset <= 0.0 {
            return Duration::ZERO;
        }

        let target_burn = pool.remaining as f64 / seconds_to_reset;
        let current_burn = forecast.burn_rate.mean;
        if current_burn - target_burn <= 0.0 {
            return Duration::ZERO;
        }

        let kp = kp_override.filter(|k| *k > 0.0).unwrap_or(self.kp);
        let wait = (kp * (current_burn / target_burn - 1.0)).clamp(0.0, MAX_WAIT_SECONDS);
        if wait.is_finite() {
            Duration::from_secs_f64(wait)
        } else {
            Duration::from_secs_f64(MAX_WAIT_SECONDS)
        }
    }
}

impl Default for DelayController {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::forecast::{BurnRate, Forecast, Risk, TimeToExhaustion};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn pool(remaining: i64, reset_in: i64, burn: Option<f64>) -> PoolState {
        let mut state = PoolState::new("github", "core");
        state.remaining = remaining;
        state.reset_at = Some(now() + chrono::Duration::seconds(reset_in));
        state.latest_forecast = burn.map(|mean| Forecast {
            tte: TimeToExhaustion {
                p50_seconds: 0,
                p90_seconds: 0,
                p99_seconds: 0,
            },
            risk: Risk {
                probability_exhaustion_before_reset: 0.0,
                safety_margin_seconds: 0,
                ttr_seconds: 0,
            },
            burn_rate: BurnRate {
                mean,
                variance: 0.0,
                unit: "per_second".into(),
            },
            cost_burn_rate: BurnRate {
                mean: 0.0,
                variance: 0.0,
                unit: "micro_usd/s".into(),
            },
        });
        state
    }

    #[test]
    fn no_forecast_means_no_wait() {
        let controller = DelayController::new(2.0);
        assert_eq!(
            controller.calculate_wait(&pool(100, 100, None), now(), None),
            Duration::ZERO
        );
    }

    #[test]
    fn past_reset_means_no_wait() {
        let controller = DelayController::new(2.0);
        assert_eq!(
            controller.calculate_wait(&pool(100, -5, Some(10.0)), now(), None),
            Duration::ZERO
        );
    }

    #[test]
    fn under_target_means_no_wait() {
        // target = 100 / 100 = 1.0/s
        let controller = DelayController::new(2.0);
        assert_eq!(
            controller.calculate_wait(&pool(100, 100, Some(0.5)), now(), None),
            Duration::ZERO
        );
    }

    #[test]
    fn proportional_to_overshoot() {
        // target 1.0/s, current 2.0/s, kp 2 => 2 * (2 - 1) = 2s
        let controller = DelayController::new(2.0);
        let wait = controller.calculate_wait(&pool(100, 100, Some(2.0)), now(), None);
        assert_eq!(wait, Duration::from_secs(2));
    }

    #[test]
    fn positive_override_replaces_gain() {
        let controller = DelayController::new(2.0);
        let pool = pool(100, 100, Some(2.0));
        assert_eq!(
            controller.calculate_wait(&pool, now(), Some(5.0)),
            Duration::from_secs(5)
        );
        assert_eq!(
            controller.calculate_wait(&pool, now(), Some(0.0)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn clamps_to_thirty_seconds() {
        let controller = DelayController::new(10.0);
        let wait = controller.calculate_wait(&pool(100, 100, Some(50.0)), now(), None);
        assert_eq!(wait, Duration::from_secs(30));
    }
}
