//! Policy middleware: every tool call passes through here exactly once.
//!
//! A call gets one [`ToolCallRecord`], created before the evaluator runs and
//! mutated in place through its transition methods afterwards:
//!
//! ```text
//! PENDING --allow--> EXECUTING --> COMPLETED
//!    |
//!    +--deny--> DENIED
//!    |
//!    +--ask--> (approval hub) --> allow / deny as above
//! ```
//!
//! Denials and execution failures are reported with different error kinds.
//! A `DenyAbort` marks the [`Turn`] so later calls are refused, but calls
//! already executing run to completion. A call parked on approval when its
//! turn aborts is denied even if the approval later comes back positive.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::metrics::McpMetrics;
use crate::{
    approval::{
        ApprovalHub, ApprovalResolution, AuditEntry, AuditLog, AwaitOutcome, DecisionResult,
        PolicyDecision, PolicyEvaluator,
    },
    compositor::{Compositor, ToolResult},
    error::{ApprovalError, DenialKind, McpError, McpResult, TransitionError},
    record::{
        DecisionSource, ExecutionState, RecordStore, ToolCallPayload, ToolCallRecord, Verdict,
    },
    scope::CallerContext,
};

/// One agent turn. Calls made under the same turn share its abort flag.
#[derive(Debug)]
pub struct Turn {
    caller: CallerContext,
    abort: Mutex<Option<String>>,
}

impl Turn {
    pub fn new(caller: CallerContext) -> Self {
        Self {
            caller,
            abort: Mutex::new(None),
        }
    }

    pub fn caller(&self) -> &CallerContext {
        &self.caller
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.lock().is_some()
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort.lock().clone()
    }

    /// Mark the turn aborted. The first reason sticks; returns false if the
    /// turn was already aborted.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let mut abort = self.abort.lock();
        if abort.is_some() {
            return false;
        }
        *abort = Some(reason.into());
        true
    }
}

#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub call_id: String,
    /// Routed tool name, `<prefix>/<server>/<tool>`.
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    /// A request with a fresh call id.
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            arguments,
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }
}

/// A call that ran. `result` is the downstream response, unchanged.
#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome {
    pub call_id: String,
    pub result: ToolResult,
    /// The turn was aborted while this call executed.
    pub turn_aborting: bool,
}

pub struct PolicyMiddleware {
    evaluator: Arc<dyn PolicyEvaluator>,
    compositor: Arc<Compositor>,
    hub: Arc<ApprovalHub>,
    store: Arc<dyn RecordStore>,
    audit: Arc<AuditLog>,
    metrics: Arc<McpMetrics>,
    approval_timeout: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl PolicyMiddleware {
    pub fn new(
        evaluator: Arc<dyn PolicyEvaluator>,
        compositor: Arc<Compositor>,
        hub: Arc<ApprovalHub>,
        store: Arc<dyn RecordStore>,
        audit: Arc<AuditLog>,
        metrics: Arc<McpMetrics>,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            evaluator,
            compositor,
            hub,
            store,
            audit,
            metrics,
            approval_timeout,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Calls currently between record creation and their final outcome.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn call_tool(&self, turn: &Turn, request: ToolCallRequest) -> McpResult<CallOutcome> {
        if let Some(reason) = turn.abort_reason() {
            self.metrics.record_turn_rejection();
            debug!(call_id = %request.call_id, "Call refused; turn already aborted");
            return Err(McpError::TurnAborted { reason });
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = scopeguard::guard(Arc::clone(&self.in_flight), |count| {
            count.fetch_sub(1, Ordering::SeqCst);
        });
        self.metrics.record_call_received();

        let caller = turn.caller();
        let mut record = ToolCallRecord::new(
            request.call_id,
            caller,
            ToolCallPayload::new(request.tool_name, request.arguments),
        );
        if let Err(e) = self.store.create(&record).await {
            if matches!(e, McpError::DuplicateRecord(_)) {
                error!(call_id = %record.call_id(), "Second record construction attempted for one call");
            }
            return Err(e);
        }

        let evaluated = self.evaluator.evaluate(
            &record.payload().name,
            &record.payload().arguments,
            caller,
        );
        let outcome = match evaluated {
            Ok(outcome) => outcome,
            Err(e) => return self.fail_closed(record, e.to_string()).await,
        };

        record.record_policy(outcome.decision, outcome.reason)?;
        self.persist(&record).await;

        let mut timed_out = false;
        if outcome.decision == PolicyDecision::Ask {
            timed_out = self.await_approval(&mut record).await?;
        }

        // A sibling may have aborted the turn while this call was parked.
        if record.verdict() == Some(Verdict::Allow) {
            if let Some(reason) = turn.abort_reason() {
                return self.refuse_for_aborted_turn(record, reason).await;
            }
        }

        match record.verdict() {
            Some(Verdict::Allow) => self.execute(turn, record).await,
            Some(Verdict::DenyAbort) => self.deny(turn, record, DenialKind::Abort, timed_out).await,
            Some(Verdict::DenyContinue) => {
                self.deny(turn, record, DenialKind::Continue, timed_out).await
            }
            None => Err(TransitionError::DecisionMismatch {
                call_id: record.call_id().to_string(),
                detail: "no verdict after policy and approval".to_string(),
            }
            .into()),
        }
    }

    /// Park the call in the approval hub and fold the resolution into the
    /// record. Returns true when the resolution came from the timeout.
    async fn await_approval(&self, record: &mut ToolCallRecord) -> McpResult<bool> {
        self.audit_entry(record, DecisionResult::Pending, DecisionSource::Policy);
        self.metrics.record_approval_requested();

        let awaited = match self.hub.submit(record) {
            Ok(_) => self.hub.wait(record.call_id(), self.approval_timeout).await,
            Err(e) => Err(e),
        };
        let (resolution, source, reason, timed_out) = match awaited {
            Ok(awaited) => {
                let timed_out = matches!(awaited, AwaitOutcome::TimedOut(_));
                let item = awaited.into_item();
                let timed_out = timed_out || item.resolved_by == Some(DecisionSource::Timeout);
                let resolution =
                    item.status
                        .resolution()
                        .ok_or_else(|| TransitionError::DecisionMismatch {
                            call_id: item.call_id.clone(),
                            detail: "approval returned unresolved".to_string(),
                        })?;
                let source = item.resolved_by.unwrap_or(DecisionSource::Human);
                (resolution, source, item.reason, timed_out)
            }
            Err(McpError::Approval(ApprovalError::Closed)) => (
                ApprovalResolution::DeniedAbort,
                DecisionSource::Shutdown,
                Some("approval hub closed".to_string()),
                false,
            ),
            Err(e) => return Err(e),
        };

        record.record_approval(resolution, source, reason)?;
        self.persist(record).await;

        if timed_out {
            self.metrics.record_approval_timed_out();
        } else if resolution == ApprovalResolution::Approved {
            self.metrics.record_approval_approved();
        } else {
            self.metrics.record_approval_denied();
        }
        Ok(timed_out)
    }

    async fn refuse_for_aborted_turn(
        &self,
        mut record: ToolCallRecord,
        reason: String,
    ) -> McpResult<CallOutcome> {
        record.record_turn_abort(reason.clone())?;
        self.persist(&record).await;
        self.audit_entry(
            &record,
            DecisionResult::Denied {
                kind: DenialKind::Abort,
                reason: reason.clone(),
            },
            DecisionSource::TurnAbort,
        );
        self.metrics.record_turn_rejection();
        info!(call_id = %record.call_id(), reason = %reason, "Approved call dropped; turn aborted while parked");
        Err(McpError::TurnAborted { reason })
    }

    async fn execute(&self, turn: &Turn, mut record: ToolCallRecord) -> McpResult<CallOutcome> {
        record.begin_execution()?;
        self.persist(&record).await;
        let source = record
            .decision()
            .map_or(DecisionSource::Policy, |d| d.source);
        self.audit_entry(&record, DecisionResult::Allowed, source);

        let tool = record.payload().name.clone();
        let started = Instant::now();
        let routed = self
            .compositor
            .route_tool(&tool, record.payload().arguments.clone())
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let turn_aborting = turn.is_aborted();

        match routed {
            Ok(result) => {
                record.complete(ExecutionState::Succeeded {
                    output: serde_json::to_value(&result).unwrap_or_default(),
                    is_error: result.is_error(),
                    duration_ms,
                })?;
                self.persist(&record).await;
                self.metrics
                    .record_execution(&tool, !result.is_error(), duration_ms);
                debug!(call_id = %record.call_id(), tool = %tool, duration_ms, "Call completed");
                Ok(CallOutcome {
                    call_id: record.call_id().to_string(),
                    result,
                    turn_aborting,
                })
            }
            Err(e) => {
                record.complete(ExecutionState::Failed {
                    error: e.to_string(),
                    duration_ms,
                })?;
                self.persist(&record).await;
                self.metrics.record_execution(&tool, false, duration_ms);
                warn!(call_id = %record.call_id(), tool = %tool, error = %e, "Call execution failed");
                Err(match e {
                    McpError::Downstream { source, .. } => McpError::ExecutionFailed {
                        call_id: record.call_id().to_string(),
                        source,
                    },
                    other => other,
                })
            }
        }
    }

    async fn deny(
        &self,
        turn: &Turn,
        mut record: ToolCallRecord,
        kind: DenialKind,
        timed_out: bool,
    ) -> McpResult<CallOutcome> {
        record.deny()?;
        self.persist(&record).await;

        let decision = record.decision();
        let source = decision.map_or(DecisionSource::Policy, |d| d.source);
        let reason = decision
            .and_then(|d| d.reason.clone())
            .unwrap_or_else(|| format!("tool '{}' denied by policy", record.payload().name));
        let call_id = record.call_id().to_string();

        let result = if timed_out {
            DecisionResult::TimedOut { kind }
        } else {
            DecisionResult::Denied {
                kind,
                reason: reason.clone(),
            }
        };
        self.audit_entry(&record, result, source);
        self.metrics.record_denial(kind);

        if kind == DenialKind::Abort && turn.abort(reason.clone()) {
            info!(call_id = %call_id, agent_id = %record.agent_id(), reason = %reason, "Turn aborted");
        }
        info!(call_id = %call_id, tool = %record.payload().name, kind = ?kind, timed_out, "Call denied");

        Err(if timed_out {
            McpError::ApprovalTimeout {
                call_id,
                resolution: kind,
            }
        } else {
            McpError::PolicyDenied {
                call_id,
                kind,
                reason,
            }
        })
    }

    async fn fail_closed(&self, mut record: ToolCallRecord, detail: String) -> McpResult<CallOutcome> {
        warn!(call_id = %record.call_id(), error = %detail, "Policy evaluator failed; denying call");
        record.record_evaluator_failure(detail.clone())?;
        record.deny()?;
        self.persist(&record).await;
        self.audit_entry(
            &record,
            DecisionResult::Denied {
                kind: DenialKind::Continue,
                reason: detail.clone(),
            },
            DecisionSource::EvaluatorFailure,
        );
        self.metrics.record_denial(DenialKind::Continue);
        Err(McpError::PolicyEvaluation {
            call_id: record.call_id().to_string(),
            detail,
        })
    }

    async fn persist(&self, record: &ToolCallRecord) {
        if let Err(e) = self.store.update(record).await {
            error!(call_id = %record.call_id(), state = ?record.state(), error = %e, "Failed to persist tool-call record");
        }
    }

    fn audit_entry(&self, record: &ToolCallRecord, result: DecisionResult, source: DecisionSource) {
        self.audit.record(AuditEntry::new(
            record.agent_id().clone(),
            record.run_id().clone(),
            record.call_id(),
            record.payload().name.clone(),
            result,
            source,
        ));
    }
}
