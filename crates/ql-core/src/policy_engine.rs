//! Intent arbitration against the active policy set.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::condition::Environment;
use crate::controller::DelayController;
use crate::policy::{Action, CompiledPolicy, CompiledRule, PolicySet};
use crate::projection::{PoolState, UsageProjection};
use crate::window::window_matches;

pub const REASON_DEFAULT_ALLOW: &str = "policy:default_allow";
pub const REASON_RULE_MATCHED: &str = "policy:rule_matched";
pub const REASON_RULE_PASSED: &str = "policy:rule_passed";
pub const REASON_PASSED_WITH_WARNING: &str = "policy:rule_passed_with_warning";
pub const REASON_SHAPING: &str = "policy:shaping_applied";
pub const REASON_DEFERRED: &str = "policy:deferred_until_reset";
pub const DEFAULT_WARNING: &str = "policy:warning";

const DEFAULT_JITTER_SECONDS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    ApproveWithModifications,
    DenyWithReason,
}

impl Decision {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::ApproveWithModifications => "approve_with_modifications",
            Self::DenyWithReason => "deny_with_reason",
        }
    }
}

/// A request to consume quota.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(default)]
    pub intent_id: String,
    pub agent_id: String,
    pub identity_id: String,
    pub workload_id: String,
    pub scope_id: String,
    pub provider_id: String,
    pub pool_id: String,
    pub expected_cost: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Modifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_switch: Option<String>,
}

impl Modifications {
    pub const fn is_empty(&self) -> bool {
        self.wait_seconds.is_none() && self.identity_switch.is_none()
    }
}

/// One evaluated rule, for explaining a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTrace {
    pub policy_id: String,
    pub rule_index: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule_name: String,
    pub condition: String,
    pub matched: bool,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvaluationResult {
    pub decision: Decision,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Modifications::is_empty")]
    pub modifications: Modifications,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<RuleTrace>,
}

impl PolicyEvaluationResult {
    fn approve(reason: &str) -> Self {
        Self {
            decision: Decision::Approve,
            reason: reason.to_string(),
            modifications: Modifications::default(),
            warnings: Vec::new(),
            trace: Vec::new(),
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            decision: Decision::DenyWithReason,
            ..Self::approve(&reason)
        }
    }
}

/// Evaluates intents against the usage projection and a hot-swappable
/// [`PolicySet`]. Holds no per-call state.
pub struct PolicyEngine {
    usage: Arc<UsageProjection>,
    policies: RwLock<Option<Arc<PolicySet>>>,
    controller: DelayController,
}

/// Accumulated state while walking rules.
struct Walk {
    trace: Vec<RuleTrace>,
    warnings: Vec<String>,
    approved: bool,
}

impl PolicyEngine {
    pub fn new(usage: Arc<UsageProjection>, controller: DelayController) -> Self {
        Self {
            usage,
            policies: RwLock::new(None),
            controller,
        }
    }

    /// Atomically replaces the active policy set.
    pub fn load(&self, set: PolicySet) {
        let set = Arc::new(set);
        tracing::info!(policies = set.policies().len(), "policy set activated");
        *self
            .policies
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(set);
    }

    /// Drops the active set; evaluation falls back to the budget check.
    pub fn clear(&self) {
        *self
            .policies
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn active(&self) -> Option<Arc<PolicySet>> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn evaluate(&self, intent: &Intent) -> PolicyEvaluationResult {
        self.evaluate_at(intent, Utc::now())
    }

    pub fn evaluate_at(&self, intent: &Intent, now: DateTime<Utc>) -> PolicyEvaluationResult {
        let pool = if intent.provider_id.is_empty() || intent.pool_id.is_empty() {
            None
        } else {
            self.usage.pool(&intent.provider_id, &intent.pool_id)
        };

        match self.active() {
            None => evaluate_budget(intent, pool.as_ref()),
            Some(set) => self.evaluate_policies(&set, intent, pool.as_ref(), now),
        }
    }

    fn evaluate_policies(
        &self,
        set: &PolicySet,
        intent: &Intent,
        pool: Option<&PoolState>,
        now: DateTime<Utc>,
    ) -> PolicyEvaluationResult {
        let mut walk = Walk {
            trace: Vec::new(),
            warnings: Vec::new(),
            approved: false,
        };

        for policy in set.for_scope(&intent.scope_id) {
            if !window_matches(policy.window.as_ref(), now) {
                continue;
            }
            let env = environment(intent, policy, pool);
            for rule in &policy.rules {
                if !window_matches(rule.window.as_ref(), now) {
                    continue;
                }
                let outcome = rule.condition.evaluate(&env);
                walk.trace.push(RuleTrace {
                    policy_id: policy.id.clone(),
                    rule_index: rule.index,
                    rule_name: rule.name.clone(),
                    condition: rule.condition_text.clone(),
                    matched: outcome.matched,
                    explanation: outcome.explanation,
                });
                if !outcome.matched {
                    continue;
                }

                tracing::debug!(policy_id = %policy.id, rule = rule.index, action = ?rule.action, "rule matched");
                match rule.action {
                    Action::Warn => walk.warnings.push(
                        rule.params
                            .message
                            .clone()
                            .unwrap_or_else(|| DEFAULT_WARNING.to_string()),
                    ),
                    Action::Approve => {
                        walk.approved = true;
                        break;
                    }
                    Action::Deny => {
                        let reason = rule
                            .params
                            .reason
                            .clone()
                            .unwrap_or_else(|| REASON_RULE_MATCHED.to_string());
                        return finish(PolicyEvaluationResult::deny(reason), walk);
                    }
                    Action::Shape | Action::Delay => {
                        let wait = self.shape_wait(rule, pool, now);
                        return finish(modified(REASON_SHAPING, wait, rule), walk);
                    }
                    Action::Defer => {
                        let wait = defer_wait(rule, pool, now);
                        return finish(modified(REASON_DEFERRED, wait, rule), walk);
                    }
                }
            }
        }

        let reason = if walk.approved {
            REASON_RULE_PASSED
        } else if walk.warnings.is_empty() {
            REASON_DEFAULT_ALLOW
        } else {
            REASON_PASSED_WITH_WARNING
        };
        finish(PolicyEvaluationResult::approve(reason), walk)
    }

    fn shape_wait(&self, rule: &CompiledRule, pool: Option<&PoolState>, now: DateTime<Utc>) -> f64 {
        if rule.params.is_dynamic() {
            pool.map_or(0.0, |p| {
                self.controller
                    .calculate_wait(p, now, rule.params.kp)
                    .as_secs_f64()
            })
        } else {
            rule.params.wait_seconds.unwrap_or(0.0).max(0.0)
        }
    }
}

/// Used when no policy set is loaded: deny only when the pool is known and
/// cannot cover the expected cost.
fn evaluate_budget(intent: &Intent, pool: Option<&PoolState>) -> PolicyEvaluationResult {
    match pool {
        Some(pool) if pool.remaining < intent.expected_cost => {
            PolicyEvaluationResult::deny(format!(
                "insufficient_budget: remaining {} < cost {}",
                pool.remaining, intent.expected_cost
            ))
        }
        _ => PolicyEvaluationResult::approve(REASON_DEFAULT_ALLOW),
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "quota counters stay far below 2^53"
)]
fn environment<'a>(
    intent: &'a Intent,
    policy: &CompiledPolicy,
    pool: Option<&PoolState>,
) -> Environment<'a> {
    let Some(pool) = pool else {
        return Environment {
            provider_id: &intent.provider_id,
            ..Environment::default()
        };
    };
    let remaining = match policy.limit {
        Some(limit) if limit > 0 => limit - pool.used,
        _ => pool.remaining,
    };
    Environment {
        provider_id: &intent.provider_id,
        remaining: Some(remaining as f64),
        used: Some(pool.used as f64),
        cost: Some(pool.cost.as_f64()),
        forecast_tte: pool
            .latest_forecast
            .as_ref()
            .map(|f| f.tte.p99_seconds as f64),
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "milliseconds to reset stay far below 2^53"
)]
fn defer_wait(rule: &CompiledRule, pool: Option<&PoolState>, now: DateTime<Utc>) -> f64 {
    let until_reset = pool
        .and_then(|p| p.reset_at)
        .map_or(0.0, |reset_at| {
            ((reset_at - now).num_milliseconds() as f64 / 1000.0).max(0.0)
        });
    let jitter_max = rule
        .params
        .jitter_max_seconds
        .unwrap_or(DEFAULT_JITTER_SECONDS);
    let jitter = if jitter_max > 0.0 && jitter_max.is_finite() {
        rand::thread_rng().gen_range(0.0..jitter_max)
    } else {
        0.0
    };
    until_reset + jitter
}

fn modified(reason: &str, wait: f64, rule: &CompiledRule) -> PolicyEvaluationResult {
    PolicyEvaluationResult {
        decision: Decision::ApproveWithModifications,
        modifications: Modifications {
            wait_seconds: Some(wait),
            identity_switch: rule.params.identity_switch.clone(),
        },
        ..PolicyEvaluationResult::approve(reason)
    }
}

fn finish(mut result: PolicyEvaluationResult, walk: Walk) -> PolicyEvaluationResult {
    result.trace = walk.trace;
    result.warnings = walk.warnings;
    result
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::event::fixtures::event_at;
    use crate::event_type::EventType;
    use crate::projection::Projection;

    fn now() -> DateTime<Utc> {
        // A Monday.
        Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap()
    }

    fn engine_with_pool(used: i64, remaining: i64) -> PolicyEngine {
        let usage = Arc::new(UsageProjection::new());
        usage
            .apply(&event_at(
                "u1",
                EventType::UsageObserved,
                0,
                json!({"provider_id": "github", "pool_id": "core", "used": used, "remaining": remaining}),
            ))
            .unwrap();
        PolicyEngine::new(usage, DelayController::new(1.0))
    }

    fn intent(cost: i64) -> Intent {
        Intent {
            intent_id: "i-1".into(),
            agent_id: "agent".into(),
            identity_id: "id".into(),
            workload_id: "wl".into(),
            scope_id: "team-a".into(),
            provider_id: "github".into(),
            pool_id: "core".into(),
            expected_cost: cost,
        }
    }

    fn load(engine: &PolicyEngine, doc: serde_json::Value) {
        engine.load(PolicySet::from_json(&doc.to_string()).expect("policy"));
    }

    #[test]
    fn budget_check_without_policies() {
        let engine = engine_with_pool(50, 50);

        let denied = engine.evaluate_at(&intent(60), now());
        assert_eq!(denied.decision, Decision::DenyWithReason);
        assert_eq!(denied.reason, "insufficient_budget: remaining 50 < cost 60");

        let approved = engine.evaluate_at(&intent(10), now());
        assert_eq!(approved.decision, Decision::Approve);
        assert_eq!(approved.reason, REASON_DEFAULT_ALLOW);
    }

    #[test]
    fn budget_check_allows_unknown_pool() {
        let engine = engine_with_pool(50, 50);
        let mut unknown = intent(1_000);
        unknown.pool_id = "search".into();
        assert_eq!(engine.evaluate_at(&unknown, now()).decision, Decision::Approve);
    }

    #[test]
    fn deny_uses_limit_minus_used() {
        let engine = engine_with_pool(95, 5000);
        load(
            &engine,
            json!({"policies": [{"id": "cap", "scope": "global", "type": "hard", "limit": 100, "rules": [
                {"condition": "remaining < 10", "action": "deny", "params": {"reason": "hard cap reached"}}
            ]}]}),
        );

        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.decision, Decision::DenyWithReason);
        assert_eq!(result.reason, "hard cap reached");
        assert_eq!(result.trace.len(), 1);
        assert!(result.trace[0].matched);
        assert_eq!(result.trace[0].explanation, "passed: remaining 5 < 10");
    }

    #[test]
    fn deny_without_reason_uses_fallback() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [{"id": "p", "rules": [{"condition": "remaining < 10", "action": "deny"}]}]}),
        );
        assert_eq!(engine.evaluate_at(&intent(1), now()).reason, REASON_RULE_MATCHED);
    }

    #[test]
    fn warnings_accumulate_and_continue() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [{"id": "p", "rules": [
                {"condition": "remaining < 10", "action": "warn", "params": {"message": "low"}},
                {"condition": "used > 90", "action": "warn"},
                {"condition": "used > 1000", "action": "deny"}
            ]}]}),
        );

        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.decision, Decision::Approve);
        assert_eq!(result.reason, REASON_PASSED_WITH_WARNING);
        assert_eq!(result.warnings, vec!["low".to_string(), DEFAULT_WARNING.to_string()]);
        assert_eq!(result.trace.len(), 3);
    }

    #[test]
    fn warning_then_deny_keeps_warnings() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [{"id": "p", "rules": [
                {"condition": "remaining < 10", "action": "warn", "params": {"message": "low"}},
                {"condition": "remaining < 6", "action": "deny", "params": {"reason": "empty"}}
            ]}]}),
        );

        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.decision, Decision::DenyWithReason);
        assert_eq!(result.warnings, vec!["low".to_string()]);
    }

    #[test]
    fn approve_short_circuits_only_its_policy() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [
                {"id": "team", "scope": "team-a", "rules": [
                    {"condition": "provider_id == github", "action": "approve"},
                    {"condition": "remaining < 10", "action": "deny"}
                ]},
                {"id": "global", "scope": "global", "rules": [
                    {"condition": "used > 1000", "action": "deny"}
                ]}
            ]}),
        );

        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.decision, Decision::Approve);
        assert_eq!(result.reason, REASON_RULE_PASSED);
        let evaluated: Vec<(&str, usize)> = result
            .trace
            .iter()
            .map(|t| (t.policy_id.as_str(), t.rule_index))
            .collect();
        assert_eq!(evaluated, vec![("team", 0), ("global", 0)]);
    }

    #[test]
    fn approve_does_not_mask_later_deny() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [
                {"id": "team", "scope": "team-a", "rules": [
                    {"condition": "provider_id == github", "action": "approve"}
                ]},
                {"id": "global", "rules": [
                    {"condition": "remaining < 10", "action": "deny", "params": {"reason": "global floor"}}
                ]}
            ]}),
        );
        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.decision, Decision::DenyWithReason);
        assert_eq!(result.reason, "global floor");
    }

    #[test]
    fn other_scopes_are_skipped() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [{"id": "b", "scope": "team-b", "rules": [
                {"condition": "remaining < 10", "action": "deny"}
            ]}]}),
        );
        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.decision, Decision::Approve);
        assert_eq!(result.reason, REASON_DEFAULT_ALLOW);
        assert!(result.trace.is_empty());
    }

    #[test]
    fn shape_sets_wait_and_identity_switch() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [{"id": "p", "rules": [
                {"condition": "remaining < 10", "action": "shape",
                 "params": {"wait_seconds": 2.5, "identity_switch": "backup-token"}}
            ]}]}),
        );

        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.decision, Decision::ApproveWithModifications);
        assert_eq!(result.reason, REASON_SHAPING);
        assert_eq!(result.modifications.wait_seconds, Some(2.5));
        assert_eq!(result.modifications.identity_switch.as_deref(), Some("backup-token"));
    }

    #[test]
    fn dynamic_shape_without_forecast_waits_zero() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [{"id": "p", "rules": [
                {"condition": "remaining < 10", "action": "delay", "params": {"algorithm": "dynamic", "kp": 3}}
            ]}]}),
        );
        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.decision, Decision::ApproveWithModifications);
        assert_eq!(result.modifications.wait_seconds, Some(0.0));
    }

    #[test]
    fn defer_waits_until_reset_plus_jitter() {
        let engine = engine_with_pool(95, 5);
        engine
            .usage
            .apply(&event_at(
                "r1",
                EventType::ResetObserved,
                1,
                json!({"provider_id": "github", "pool_id": "core", "reset_at": "2025-01-06T12:01:00Z"}),
            ))
            .unwrap();
        load(
            &engine,
            json!({"policies": [{"id": "p", "rules": [
                {"condition": "remaining < 10", "action": "defer", "params": {"jitter_max_seconds": 0.5}}
            ]}]}),
        );

        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.reason, REASON_DEFERRED);
        let wait = result.modifications.wait_seconds.unwrap();
        assert!((60.0..60.5).contains(&wait), "wait was {wait}");
    }

    #[test]
    fn defer_without_reset_is_jitter_only() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [{"id": "p", "rules": [
                {"condition": "remaining < 10", "action": "defer", "params": {"jitter_max_seconds": 0}}
            ]}]}),
        );
        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.modifications.wait_seconds, Some(0.0));
    }

    #[test]
    fn unparseable_condition_fails_open() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [{"id": "p", "rules": [
                {"condition": "remaining <= 10", "action": "deny"}
            ]}]}),
        );
        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.decision, Decision::Approve);
        assert!(!result.trace[0].matched);
    }

    #[test]
    fn time_windows_gate_rules_and_policies() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [
                {"id": "weekend", "time_window": {"days": ["sat", "sun"]}, "rules": [
                    {"condition": "remaining < 10", "action": "deny", "params": {"reason": "weekend"}}
                ]},
                {"id": "nights", "rules": [
                    {"condition": "remaining < 10", "action": "deny", "params": {"reason": "night"},
                     "time_window": {"start_time": "22:00", "end_time": "06:00"}},
                    {"condition": "remaining < 10", "action": "deny", "params": {"reason": "weekday"},
                     "time_window": {"days": ["Mon"]}}
                ]}
            ]}),
        );

        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.reason, "weekday");
        assert_eq!(result.trace.len(), 1);
    }

    #[test]
    fn forecast_condition_needs_a_forecast() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [{"id": "p", "rules": [
                {"condition": "forecast_tte < 3600", "action": "deny"}
            ]}]}),
        );
        let result = engine.evaluate_at(&intent(1), now());
        assert_eq!(result.decision, Decision::Approve);
        assert_eq!(result.trace[0].explanation, "failed: forecast_tte unavailable");
    }

    #[test]
    fn clear_restores_budget_check() {
        let engine = engine_with_pool(50, 50);
        load(&engine, json!({"policies": []}));
        assert_eq!(engine.evaluate_at(&intent(60), now()).decision, Decision::Approve);
        engine.clear();
        assert_eq!(
            engine.evaluate_at(&intent(60), now()).decision,
            Decision::DenyWithReason
        );
    }

    #[test]
    fn deny_result_json() {
        let engine = engine_with_pool(95, 5);
        load(
            &engine,
            json!({"policies": [{"id": "cap", "limit": 100, "rules": [
                {"condition": "remaining < 10", "action": "deny", "params": {"reason": "hard cap reached"}}
            ]}]}),
        );
        let result = engine.evaluate_at(&intent(1), now());
        insta::assert_snapshot!(serde_json::to_string_pretty(&result).unwrap(), @r#"
        {
          "decision": "deny_with_reason",
          "reason": "hard cap reached",
          "trace": [
            {
              "policy_id": "cap",
              "rule_index": 0,
              "condition": "remaining < 10",
              "matched": true,
              "explanation": "passed: remaining 5 < 10"
            }
          ]
        }
        "#);
    }

    #[test]
    fn result_serializes_without_empty_fields() {
        let engine = engine_with_pool(50, 50);
        let json = serde_json::to_value(engine.evaluate_at(&intent(10), now())).unwrap();
        assert_eq!(json, json!({"decision": "approve", "reason": "policy:default_allow"}));
    }
}
