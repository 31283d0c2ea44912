//! Policy decisions and the built-in rule table.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::{
    compositor::namespace::{Namespace, RoutedId},
    core::config::{PolicyConfig, PolicyDecisionConfig, RuleTargetConfig},
    scope::CallerContext,
};

/// Result of evaluating policy for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    /// Fail the call and the rest of the turn.
    DenyAbort,
    /// Fail only this call.
    DenyContinue,
    /// Park the call until a human decides.
    Ask,
}

impl PolicyDecision {
    pub fn is_deny(self) -> bool {
        matches!(self, PolicyDecision::DenyAbort | PolicyDecision::DenyContinue)
    }
}

/// Decision plus the reason reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub decision: PolicyDecision,
    pub reason: Option<String>,
}

impl PolicyOutcome {
    pub fn new(decision: PolicyDecision) -> Self {
        Self {
            decision,
            reason: None,
        }
    }

    pub fn with_reason(decision: PolicyDecision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: Some(reason.into()),
        }
    }
}

impl From<PolicyDecision> for PolicyOutcome {
    fn from(decision: PolicyDecision) -> Self {
        Self::new(decision)
    }
}

impl From<&PolicyDecisionConfig> for PolicyOutcome {
    fn from(config: &PolicyDecisionConfig) -> Self {
        Self {
            decision: config.decision,
            reason: config.reason.clone(),
        }
    }
}

/// The evaluator could not produce a decision.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct PolicyError(pub String);

/// Decides whether a tool call may run.
///
/// Implementations must not have gateway-visible side effects and must be
/// safe to call concurrently.
pub trait PolicyEvaluator: Send + Sync {
    fn evaluate(
        &self,
        tool_name: &str,
        arguments: &Value,
        caller: &CallerContext,
    ) -> Result<PolicyOutcome, PolicyError>;
}

impl<F> PolicyEvaluator for F
where
    F: Fn(&str, &Value, &CallerContext) -> Result<PolicyOutcome, PolicyError> + Send + Sync,
{
    fn evaluate(
        &self,
        tool_name: &str,
        arguments: &Value,
        caller: &CallerContext,
    ) -> Result<PolicyOutcome, PolicyError> {
        self(tool_name, arguments, caller)
    }
}

/// What a rule's regex is matched against.
#[derive(Debug, Clone)]
pub enum RulePattern {
    Server(Regex),
    Tool(Regex),
    /// The full routed identifier.
    Qualified(Regex),
    Any,
}

impl RulePattern {
    pub fn matches(&self, routed: &str, id: Option<&RoutedId>) -> bool {
        match self {
            RulePattern::Server(re) => id.is_some_and(|id| re.is_match(&id.server)),
            RulePattern::Tool(re) => id.is_some_and(|id| re.is_match(&id.local)),
            RulePattern::Qualified(re) => re.is_match(routed),
            RulePattern::Any => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub name: String,
    pub pattern: RulePattern,
    pub outcome: PolicyOutcome,
}

impl PolicyRule {
    pub fn new(name: impl Into<String>, pattern: RulePattern, outcome: impl Into<PolicyOutcome>) -> Self {
        Self {
            name: name.into(),
            pattern,
            outcome: outcome.into(),
        }
    }
}

/// Static lookup table: tool policy, then server default, then rules, then
/// the global default.
pub struct PolicyEngine {
    namespace: Namespace,
    default_policy: PolicyOutcome,
    server_defaults: HashMap<String, PolicyOutcome>,
    tool_policies: HashMap<RoutedId, PolicyOutcome>,
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            default_policy: PolicyOutcome::new(PolicyDecision::Allow),
            server_defaults: HashMap::new(),
            tool_policies: HashMap::new(),
            rules: Vec::new(),
        }
    }

    pub fn with_default_policy(mut self, outcome: impl Into<PolicyOutcome>) -> Self {
        self.default_policy = outcome.into();
        self
    }

    pub fn with_server_default(
        mut self,
        server: impl Into<String>,
        outcome: impl Into<PolicyOutcome>,
    ) -> Self {
        self.server_defaults.insert(server.into(), outcome.into());
        self
    }

    /// `tool` is the server-local name.
    pub fn with_tool_policy(
        mut self,
        server: impl Into<String>,
        tool: impl Into<String>,
        outcome: impl Into<PolicyOutcome>,
    ) -> Self {
        self.tool_policies
            .insert(RoutedId::new(server, tool), outcome.into());
        self
    }

    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Build from config. Malformed entries are skipped with a warning;
    /// `GatewayConfig::validate` rejects them earlier on the normal path.
    pub fn from_config(config: &PolicyConfig, namespace: Namespace) -> Self {
        let mut engine = Self::new(namespace).with_default_policy(&config.default);

        for (server, decision) in &config.servers {
            engine
                .server_defaults
                .insert(server.clone(), PolicyOutcome::from(decision));
        }

        for (qualified, decision) in &config.tools {
            if let Some((server, tool)) = qualified.split_once(':') {
                engine
                    .tool_policies
                    .insert(RoutedId::new(server, tool), PolicyOutcome::from(decision));
            } else {
                warn!(
                    key = %qualified,
                    "Invalid tool policy key: expected 'server:tool' format"
                );
            }
        }

        for rule in &config.rules {
            let regex = match (&rule.target, &rule.regex) {
                (RuleTargetConfig::Any, _) => None,
                (_, Some(pattern)) => match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(rule = %rule.name, error = %e, "Skipping policy rule with invalid regex");
                        continue;
                    }
                },
                (_, None) => {
                    warn!(rule = %rule.name, "Skipping policy rule without regex");
                    continue;
                }
            };
            let pattern = match (rule.target, regex) {
                (RuleTargetConfig::Server, Some(re)) => RulePattern::Server(re),
                (RuleTargetConfig::Tool, Some(re)) => RulePattern::Tool(re),
                (RuleTargetConfig::Qualified, Some(re)) => RulePattern::Qualified(re),
                _ => RulePattern::Any,
            };
            engine
                .rules
                .push(PolicyRule::new(rule.name.clone(), pattern, &rule.decision));
        }

        engine
    }

    /// Look up the decision for a routed tool name.
    pub fn decide(&self, tool_name: &str) -> PolicyOutcome {
        let id = self.namespace.untranslate(tool_name).ok();

        if let Some(id) = &id {
            if let Some(outcome) = self.tool_policies.get(id) {
                return outcome.clone();
            }
            if let Some(outcome) = self.server_defaults.get(&id.server) {
                return outcome.clone();
            }
        }

        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(tool_name, id.as_ref()))
            .map(|rule| {
                let mut outcome = rule.outcome.clone();
                if outcome.reason.is_none() && outcome.decision != PolicyDecision::Allow {
                    outcome.reason = Some(format!("matched policy rule '{}'", rule.name));
                }
                outcome
            })
            .unwrap_or_else(|| self.default_policy.clone())
    }
}

impl PolicyEvaluator for PolicyEngine {
    fn evaluate(
        &self,
        tool_name: &str,
        _arguments: &Value,
        _caller: &CallerContext,
    ) -> Result<PolicyOutcome, PolicyError> {
        Ok(self.decide(tool_name))
    }
}
