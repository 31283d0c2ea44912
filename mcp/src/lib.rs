//! Agent-side MCP gateway.
//!
//! Mounts many downstream MCP servers under one namespace, puts a policy
//! gate (with optional human approval) in front of every tool call and fans
//! resource notifications out to per-agent subscribers.
//!
//! ## Modules
//!
//! - [`compositor`]: mounts, routing and the aggregate index
//! - [`approval`]: policy rules, the approval hub and the audit log
//! - [`notify`]: subscription registry and supervised observer delivery
//! - [`record`]: tool-call records and their state machine
//! - [`core`]: configuration, the call middleware and the assembled [`Gateway`]

pub mod error;
pub mod record;
pub mod scope;

// Subsystems
pub mod approval;
pub mod compositor;
pub mod core;
pub mod notify;

pub use approval::{
    ApprovalEvent, ApprovalHub, ApprovalItem, ApprovalObserver, ApprovalResolution,
    ApprovalStatus, AuditEntry, AuditLog, AwaitOutcome, DecisionResult, PolicyDecision,
    PolicyEngine, PolicyError, PolicyEvaluator, PolicyOutcome,
};
pub use compositor::{
    Compositor, InProcessServer, MountEvent, MountInfo, MountListener, MountOptions,
    MountStatus, Namespace, RoutedId, TransportSpec,
};
pub use core::{
    CallOutcome, Gateway, GatewayBuilder, GatewayConfig, McpMetrics, McpTransport,
    MetricsSnapshot, ToolCallRequest, Turn,
};
pub use error::{ApprovalError, DenialKind, DownstreamError, McpError, McpResult};
pub use notify::{
    Notification, ResourceObserver, SubscriptionId, SubscriptionKey, SubscriptionRegistry,
    SubscriptionTarget,
};
pub use record::{
    CallDecision, CallState, DecisionSource, ExecutionState, InMemoryRecordStore, RecordStore,
    ToolCallRecord, Verdict,
};
pub use scope::{AgentId, CallerContext, RunId};
