//! Gateway configuration.
//!
//! Loaded from YAML. Every tunable has a `default_*` function so a minimal
//! file with only `servers:` is valid.

use std::{collections::HashMap, fmt, path::Path, time::Duration};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    approval::PolicyDecision,
    compositor::namespace::{validate_mount_name, DEFAULT_PREFIX},
    error::{DenialKind, McpError, McpResult},
    scope::AgentId,
};

/// Environment variable overriding `agent_id`.
pub const AGENT_ID_ENV: &str = "MEDIATOR_AGENT_ID";
/// Environment variable overriding `namespace.prefix`.
pub const NAMESPACE_PREFIX_ENV: &str = "MEDIATOR_NAMESPACE_PREFIX";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Agent this gateway instance serves.
    #[serde(default)]
    pub agent_id: AgentId,

    #[serde(default)]
    pub namespace: NamespaceConfig,

    /// Servers mounted at startup.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamespaceConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Mount name; must match `^[a-z][a-z0-9_]*$`.
    pub name: String,

    #[serde(flatten)]
    pub transport: McpTransport,

    /// Startup fails if a required server cannot be attached.
    #[serde(default)]
    pub required: bool,

    /// Pinned mounts refuse a non-forced detach.
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum McpTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    Sse {
        url: String,
        /// Sent as `Authorization: Bearer`.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    Streamable {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl McpTransport {
    pub fn protocol(&self) -> &'static str {
        match self {
            McpTransport::Stdio { .. } => "stdio",
            McpTransport::Sse { .. } => "sse",
            McpTransport::Streamable { .. } => "streamable",
        }
    }
}

impl fmt::Debug for McpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpTransport::Stdio { command, args, envs } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("envs", &envs.keys().collect::<Vec<_>>())
                .finish(),
            McpTransport::Sse { url, token, headers }
            | McpTransport::Streamable { url, token, headers } => f
                .debug_struct(if matches!(self, McpTransport::Sse { .. }) {
                    "Sse"
                } else {
                    "Streamable"
                })
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
        }
    }
}

/// Static policy table.
///
/// Evaluation order:
/// 1. Explicit tool policies (`server:tool`)
/// 2. Server defaults
/// 3. Rules, first match wins
/// 4. `default`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    #[serde(default = "default_allow")]
    pub default: PolicyDecisionConfig,

    #[serde(default)]
    pub servers: HashMap<String, PolicyDecisionConfig>,

    /// Keyed by `server:tool` using the server-local tool name.
    #[serde(default)]
    pub tools: HashMap<String, PolicyDecisionConfig>,

    #[serde(default)]
    pub rules: Vec<PolicyRuleConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default: default_allow(),
            servers: HashMap::new(),
            tools: HashMap::new(),
            rules: Vec::new(),
        }
    }
}

/// What a rule's regex is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTargetConfig {
    Server,
    Tool,
    /// The full routed identifier.
    Qualified,
    #[default]
    Any,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyRuleConfig {
    pub name: String,
    #[serde(rename = "match", default)]
    pub target: RuleTargetConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    pub decision: PolicyDecisionConfig,
}

/// A decision with an optional reason.
///
/// Written either as a bare string (`ask`) or as a single-key map carrying
/// the reason (`deny_abort: "drops production tables"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecisionConfig {
    pub decision: PolicyDecision,
    pub reason: Option<String>,
}

impl PolicyDecisionConfig {
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

const DECISION_NAMES: &[&str] = &["allow", "deny_abort", "deny_continue", "ask"];

fn parse_decision<E: serde::de::Error>(v: &str) -> Result<PolicyDecision, E> {
    match v {
        "allow" => Ok(PolicyDecision::Allow),
        "deny_abort" => Ok(PolicyDecision::DenyAbort),
        "deny_continue" => Ok(PolicyDecision::DenyContinue),
        "ask" => Ok(PolicyDecision::Ask),
        _ => Err(E::unknown_variant(v, DECISION_NAMES)),
    }
}

impl Serialize for PolicyDecisionConfig {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.reason {
            None => self.decision.serialize(serializer),
            Some(reason) => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(&self.decision, reason)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for PolicyDecisionConfig {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::{self, MapAccess, Visitor};

        struct DecisionVisitor;

        impl<'de> Visitor<'de> for DecisionVisitor {
            type Value = PolicyDecisionConfig;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a decision name or {<decision>: \"reason\"}")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                parse_decision(v).map(PolicyDecisionConfig::new)
            }

            fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<Self::Value, M::Error> {
                let Some(key) = map.next_key::<String>()? else {
                    return Err(de::Error::custom("empty decision map"));
                };
                let decision = parse_decision(&key)?;
                let reason: String = map.next_value()?;
                if map.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom("decision map must have exactly one key"));
                }
                Ok(PolicyDecisionConfig::with_reason(decision, reason))
            }
        }

        deserializer.deserialize_any(DecisionVisitor)
    }
}

/// Resolution applied when an approval times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutResolution {
    #[default]
    DenyContinue,
    DenyAbort,
}

impl TimeoutResolution {
    pub fn denial_kind(self) -> DenialKind {
        match self {
            TimeoutResolution::DenyContinue => DenialKind::Continue,
            TimeoutResolution::DenyAbort => DenialKind::Abort,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApprovalConfig {
    /// How long a call waits for a human decision.
    #[serde(default = "default_approval_timeout_ms")]
    pub timeout_ms: u64,

    /// Expiry stamped on each item; the sweeper resolves expired items.
    #[serde(default)]
    pub item_ttl_ms: Option<u64>,

    #[serde(default)]
    pub timeout_resolution: TimeoutResolution,

    /// Resolved items kept for lookup after they leave the pending set.
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_approval_timeout_ms(),
            item_ttl_ms: None,
            timeout_resolution: TimeoutResolution::default(),
            archive_capacity: default_archive_capacity(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn item_ttl(&self) -> Option<Duration> {
        self.item_ttl_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Per-subscription coalescing window for resource updates.
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,

    /// Window for folding mount changes into one aggregate list-changed.
    #[serde(default = "default_list_changed_window_ms")]
    pub list_changed_window_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: default_coalesce_window_ms(),
            list_changed_window_ms: default_list_changed_window_ms(),
        }
    }
}

impl NotificationConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn list_changed_window(&self) -> Duration {
        Duration::from_millis(self.list_changed_window_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_entries")]
    pub max_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: default_audit_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    /// How long shutdown waits for executing calls.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_allow() -> PolicyDecisionConfig {
    PolicyDecisionConfig::new(PolicyDecision::Allow)
}

fn default_approval_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_archive_capacity() -> usize {
    1024
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_coalesce_window_ms() -> u64 {
    25
}

fn default_list_changed_window_ms() -> u64 {
    10
}

fn default_audit_entries() -> usize {
    10_000
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

impl GatewayConfig {
    /// Load and validate a YAML file.
    pub async fn from_file(path: impl AsRef<Path>) -> McpResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> McpResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MEDIATOR_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(agent) = std::env::var(AGENT_ID_ENV) {
            if !agent.is_empty() {
                self.agent_id = AgentId::new(agent);
            }
        }
        if let Ok(prefix) = std::env::var(NAMESPACE_PREFIX_ENV) {
            if !prefix.is_empty() {
                self.namespace.prefix = prefix;
            }
        }
        self
    }

    pub fn validate(&self) -> McpResult<()> {
        let prefix = &self.namespace.prefix;
        if prefix.is_empty() || prefix.contains('/') {
            return Err(McpError::Config(format!(
                "namespace.prefix '{}' must be non-empty and contain no '/'",
                prefix
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            validate_mount_name(&server.name)?;
            if !seen.insert(server.name.as_str()) {
                return Err(McpError::Config(format!(
                    "server '{}' is listed twice",
                    server.name
                )));
            }
        }

        for rule in &self.policy.rules {
            match (&rule.target, &rule.regex) {
                (RuleTargetConfig::Any, _) => {}
                (_, None) => {
                    return Err(McpError::Config(format!(
                        "policy rule '{}' needs a regex for match {:?}",
                        rule.name, rule.target
                    )))
                }
                (_, Some(pattern)) => {
                    Regex::new(pattern).map_err(|e| {
                        McpError::Config(format!("policy rule '{}': {}", rule.name, e))
                    })?;
                }
            }
        }

        if self.approval.timeout_ms == 0 {
            return Err(McpError::Config("approval.timeout_ms must be > 0".into()));
        }
        if self.approval.archive_capacity == 0 {
            return Err(McpError::Config(
                "approval.archive_capacity must be > 0".into(),
            ));
        }
        if self.approval.sweep_interval_ms == 0 {
            return Err(McpError::Config(
                "approval.sweep_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}
