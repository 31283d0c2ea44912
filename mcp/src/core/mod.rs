//! Gateway assembly: configuration, the policy middleware and counters.

pub mod config;
pub mod gateway;
pub mod metrics;
pub mod middleware;

pub use config::{
    ApprovalConfig, AuditConfig, GatewayConfig, McpTransport, NamespaceConfig,
    NotificationConfig, PolicyConfig, PolicyDecisionConfig, PolicyRuleConfig, RuleTargetConfig,
    ServerConfig, ShutdownConfig, TimeoutResolution,
};
pub use gateway::{admin_uri, Gateway, GatewayBuilder, ADMIN_SCHEME};
pub use metrics::{LatencySnapshot, McpMetrics, MetricsSnapshot};
pub use middleware::{CallOutcome, PolicyMiddleware, ToolCallRequest, Turn};
