//! Policy documents and their compiled form.
//!
//! A document is parsed and compiled as a whole. Conditions are compiled
//! once here; time windows are resolved here too, so a bad zone name or
//! time format rejects the whole document instead of surfacing per call.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::condition::Condition;
use crate::event::SENTINEL_GLOBAL;
use crate::window::{CompiledWindow, TimeWindow, TimeWindowError};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to parse policy document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("policy at position {index} has an empty id")]
    EmptyId { index: usize },
    #[error("duplicate policy id {policy_id}")]
    DuplicateId { policy_id: String },
    #[error("policy {policy_id} has unknown type '{kind}' (expected hard or soft)")]
    UnknownType { policy_id: String, kind: String },
    #[error("policy {policy_id} rule {rule} has unknown action '{action}'")]
    UnknownAction {
        policy_id: String,
        rule: usize,
        action: String,
    },
    #[error("policy {policy_id} rule {rule} has invalid params: {source}")]
    InvalidParams {
        policy_id: String,
        rule: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("policy {policy_id} has an invalid time window: {source}")]
    InvalidWindow {
        policy_id: String,
        #[source]
        source: TimeWindowError,
    },
}

/// A whole policy document, as loaded from JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub id: String,
    #[serde(default)]
    pub scope: String,
    /// "hard" or "soft".
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    #[serde(default)]
    pub name: String,
    pub condition: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Deny,
    Warn,
    Shape,
    Delay,
    Defer,
    Approve,
}

impl Action {
    fn parse(action: &str) -> Option<Self> {
        match action.trim().to_ascii_lowercase().as_str() {
            "deny" => Some(Self::Deny),
            "warn" => Some(Self::Warn),
            "shape" => Some(Self::Shape),
            "delay" => Some(Self::Delay),
            "defer" => Some(Self::Defer),
            "approve" => Some(Self::Approve),
            _ => None,
        }
    }
}

/// Typed view of a rule's `params` object. Unrecognized keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RuleParams {
    pub reason: Option<String>,
    pub message: Option<String>,
    pub wait_seconds: Option<f64>,
    pub algorithm: Option<String>,
    pub kp: Option<f64>,
    pub jitter_max_seconds: Option<f64>,
    pub identity_switch: Option<String>,
}

impl RuleParams {
    pub fn is_dynamic(&self) -> bool {
        self.algorithm.as_deref() == Some("dynamic")
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub index: usize,
    pub name: String,
    pub condition_text: String,
    pub condition: Condition,
    pub action: Action,
    pub params: RuleParams,
    pub window: Option<CompiledWindow>,
}

#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub id: String,
    pub scope: String,
    pub limit: Option<i64>,
    pub window: Option<CompiledWindow>,
    pub rules: Vec<CompiledRule>,
}

impl CompiledPolicy {
    pub fn is_global(&self) -> bool {
        is_global_scope(&self.scope)
    }
}

pub fn is_global_scope(scope: &str) -> bool {
    matches!(scope, "" | "global" | SENTINEL_GLOBAL)
}

/// A compiled, immutable policy document ready for evaluation.
#[derive(Debug, Clone)]
pub struct PolicySet {
    config: PolicyConfig,
    policies: Vec<CompiledPolicy>,
}

fn compile_window(
    window: Option<&TimeWindow>,
    policy_id: &str,
) -> Result<Option<CompiledWindow>, PolicyError> {
    window
        .map(TimeWindow::compile)
        .transpose()
        .map_err(|source| PolicyError::InvalidWindow {
            policy_id: policy_id.to_string(),
            source,
        })
}

fn compile_rule(policy_id: &str, index: usize, rule: &RuleDefinition) -> Result<CompiledRule, PolicyError> {
    let action = Action::parse(&rule.action).ok_or_else(|| PolicyError::UnknownAction {
        policy_id: policy_id.to_string(),
        rule: index,
        action: rule.action.clone(),
    })?;
    let params = serde_json::from_value(Value::Object(rule.params.clone())).map_err(|source| {
        PolicyError::InvalidParams {
            policy_id: policy_id.to_string(),
            rule: index,
            source,
        }
    })?;
    let condition = Condition::parse(&rule.condition);
    if let Condition::Invalid { reason } = &condition {
        tracing::warn!(
            policy_id,
            rule = index,
            condition = %rule.condition,
            reason = %reason,
            "condition does not parse; rule will never match"
        );
    }
    Ok(CompiledRule {
        index,
        name: rule.name.clone(),
        condition_text: rule.condition.clone(),
        condition,
        action,
        params,
        window: compile_window(rule.time_window.as_ref(), policy_id)?,
    })
}

impl PolicySet {
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        Self::compile(serde_json::from_str(json)?)
    }

    pub fn compile(config: PolicyConfig) -> Result<Self, PolicyError> {
        let mut seen = HashSet::new();
        let mut policies = Vec::with_capacity(config.policies.len());

        for (index, def) in config.policies.iter().enumerate() {
            if def.id.trim().is_empty() {
                return Err(PolicyError::EmptyId { index });
            }
            if !seen.insert(def.id.as_str()) {
                return Err(PolicyError::DuplicateId {
                    policy_id: def.id.clone(),
                });
            }
            if !matches!(def.kind.as_str(), "" | "hard" | "soft") {
                return Err(PolicyError::UnknownType {
                    policy_id: def.id.clone(),
                    kind: def.kind.clone(),
                });
            }

            let rules = def
                .rules
                .iter()
                .enumerate()
                .map(|(i, rule)| compile_rule(&def.id, i, rule))
                .collect::<Result<Vec<_>, _>>()?;

            policies.push(CompiledPolicy {
                id: def.id.clone(),
                scope: def.scope.clone(),
                limit: def.limit,
                window: compile_window(def.time_window.as_ref(), &def.id)?,
                rules,
            });
        }

        Ok(Self { config, policies })
    }

    /// The document this set was compiled from.
    pub const fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn policies(&self) -> &[CompiledPolicy] {
        &self.policies
    }

    /// Policies that apply to `scope_id`: exact scope matches first, then
    /// global policies, each in declaration order.
    pub fn for_scope<'a>(&'a self, scope_id: &'a str) -> impl Iterator<Item = &'a CompiledPolicy> + 'a {
        let scoped = self
            .policies
            .iter()
            .filter(move |p| !p.is_global() && p.scope == scope_id);
        let global = self.policies.iter().filter(|p| p.is_global());
        scoped.chain(global)
    }
}
