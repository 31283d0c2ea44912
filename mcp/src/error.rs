//! Gateway error types.
//!
//! Policy denials, execution failures and approval timeouts are separate
//! variants so callers can pick different retry behavior for each.

use serde_json::Value;
use thiserror::Error;

use crate::record::CallState;

pub type McpResult<T> = Result<T, McpError>;

/// JSON-RPC codes reserved for gateway-originated outcomes.
///
/// Downstream servers must not emit these; see [`super::DownstreamError::from_remote`].
pub mod codes {
    pub const POLICY_DENIED_ABORT: i64 = -32950;
    pub const POLICY_DENIED_CONTINUE: i64 = -32951;
    pub const APPROVAL_TIMEOUT: i64 = -32952;
    pub const TURN_ABORTED: i64 = -32953;
    pub const POLICY_EVALUATION: i64 = -32954;
    pub const SERVER_UNAVAILABLE: i64 = -32960;
    pub const EXECUTION_FAILED: i64 = -32961;
    pub const INTERNAL: i64 = -32603;
    pub const INVALID_PARAMS: i64 = -32602;

    pub const RESERVED: &[i64] = &[
        POLICY_DENIED_ABORT,
        POLICY_DENIED_CONTINUE,
        APPROVAL_TIMEOUT,
        TURN_ABORTED,
        POLICY_EVALUATION,
    ];

    pub fn is_reserved(code: i64) -> bool {
        RESERVED.contains(&code)
    }
}

/// Whether a denial ends the whole turn or just the one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    Abort,
    Continue,
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Attach failed for '{name}': {detail}")]
    AttachFailed { name: String, detail: String },

    #[error("Mount '{0}' is already attached")]
    DuplicateMount(String),

    #[error("Invalid mount name '{0}': expected ^[a-z][a-z0-9_]*$")]
    InvalidMountName(String),

    #[error("Mount '{0}' is pinned; use force to detach")]
    PinnedMount(String),

    #[error("Server unavailable: {server}: {detail}")]
    ServerUnavailable { server: String, detail: String },

    #[error("Unknown routed identifier: {0}")]
    UnknownRoute(String),

    /// Error produced by the downstream server, passed through unchanged.
    #[error("Downstream '{server}' returned an error: {source}")]
    Downstream {
        server: String,
        #[source]
        source: DownstreamError,
    },

    #[error("Policy denied call {call_id} ({kind:?}): {reason}")]
    PolicyDenied {
        call_id: String,
        kind: DenialKind,
        reason: String,
    },

    #[error("Policy evaluation failed for call {call_id}: {detail}")]
    PolicyEvaluation { call_id: String, detail: String },

    #[error("Execution failed for call {call_id}: {source}")]
    ExecutionFailed {
        call_id: String,
        #[source]
        source: DownstreamError,
    },

    #[error("Approval timed out for call {call_id} (resolved as {resolution:?})")]
    ApprovalTimeout {
        call_id: String,
        resolution: DenialKind,
    },

    #[error("Turn aborted: {reason}")]
    TurnAborted { reason: String },

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Duplicate tool-call record: {0}")]
    DuplicateRecord(String),

    #[error("Tool-call record not found: {0}")]
    RecordNotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource does not support subscriptions: {0}")]
    NotSubscribable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Transient failures that a caller may retry. Denials never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            McpError::ServerUnavailable { .. } | McpError::ExecutionFailed { .. }
        )
    }

    /// Whether this outcome ends the caller's current turn.
    pub fn aborts_turn(&self) -> bool {
        matches!(
            self,
            McpError::PolicyDenied {
                kind: DenialKind::Abort,
                ..
            } | McpError::ApprovalTimeout {
                resolution: DenialKind::Abort,
                ..
            } | McpError::TurnAborted { .. }
        )
    }

    pub fn error_code(&self) -> i64 {
        match self {
            McpError::PolicyDenied {
                kind: DenialKind::Abort,
                ..
            } => codes::POLICY_DENIED_ABORT,
            McpError::PolicyDenied {
                kind: DenialKind::Continue,
                ..
            } => codes::POLICY_DENIED_CONTINUE,
            McpError::PolicyEvaluation { .. } => codes::POLICY_EVALUATION,
            McpError::ApprovalTimeout { .. } => codes::APPROVAL_TIMEOUT,
            McpError::TurnAborted { .. } => codes::TURN_ABORTED,
            McpError::ServerUnavailable { .. } => codes::SERVER_UNAVAILABLE,
            McpError::ExecutionFailed { .. } => codes::EXECUTION_FAILED,
            McpError::UnknownRoute(_)
            | McpError::InvalidMountName(_)
            | McpError::ResourceNotFound(_)
            | McpError::NotSubscribable(_) => codes::INVALID_PARAMS,
            _ => codes::INTERNAL,
        }
    }
}

/// Approval-specific errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No pending or archived item for this call.
    #[error("Approval not found: {0}")]
    NotFound(String),

    /// An unresolved item already exists for this call.
    #[error("Approval already pending: {0}")]
    AlreadyPending(String),

    /// The item was resolved before; the earlier resolution stands.
    #[error("Approval already resolved: {0}")]
    AlreadyResolved(String),

    #[error("Approval hub is shut down")]
    Closed,
}

/// Errors reported by a downstream server or its transport.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DownstreamError {
    /// Connection-level failure; the mount may still recover.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection is gone for good.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Error response produced by the downstream server itself.
    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// A downstream error that used a gateway-reserved code.
    #[error("downstream used reserved code {code}: {message}")]
    ReservedCodeMisuse { code: i64, message: String },

    #[error("not found: {0}")]
    NotFound(String),
}

impl DownstreamError {
    /// Build a remote error, rejecting codes reserved for gateway denials.
    pub fn from_remote(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        let message = message.into();
        if codes::is_reserved(code) {
            DownstreamError::ReservedCodeMisuse { code, message }
        } else {
            DownstreamError::Remote {
                code,
                message,
                data,
            }
        }
    }

    /// Failures that are attributable to the link rather than the server's logic.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DownstreamError::Transport(_) | DownstreamError::Disconnected(_)
        )
    }
}

/// Illegal operation on a tool-call record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("call {call_id}: cannot move from {from:?} to {to:?}")]
    IllegalState {
        call_id: String,
        from: CallState,
        to: CallState,
    },

    #[error("call {call_id}: decision already recorded")]
    DecisionAlreadyRecorded { call_id: String },

    #[error("call {call_id}: {detail}")]
    DecisionMismatch { call_id: String, detail: String },
}
