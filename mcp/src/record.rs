//! Tool-call records and their storage contract.
//!
//! A [`ToolCallRecord`] is built once per call attempt and then moved through
//! its lifecycle by named transition methods:
//!
//! ```text
//! PENDING ──► EXECUTING ──► COMPLETED
//!    │
//!    └──────► DENIED
//! ```
//!
//! Fields are private; the only way to change a record is through those
//! methods, which reject anything that would move backwards or skip a step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    approval::{ApprovalResolution, PolicyDecision},
    error::{McpError, McpResult, TransitionError},
    scope::{AgentId, CallerContext, RunId},
};

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Pending,
    Executing,
    Completed,
    Denied,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Completed | CallState::Denied)
    }

    fn can_transition_to(self, next: CallState) -> bool {
        matches!(
            (self, next),
            (CallState::Pending, CallState::Executing)
                | (CallState::Pending, CallState::Denied)
                | (CallState::Executing, CallState::Completed)
        )
    }
}

/// The effective ruling on a call once policy (and approval, if asked) is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    DenyAbort,
    DenyContinue,
}

/// Who produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Policy,
    Human,
    Timeout,
    Shutdown,
    EvaluatorFailure,
    /// The call's turn was aborted before it could start executing.
    TurnAbort,
}

/// Decision data attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDecision {
    /// What the policy evaluator returned. Never changes once set.
    pub policy: PolicyDecision,
    /// Filled in when `policy` is `Ask` and the approval resolves.
    pub approval: Option<ApprovalResolution>,
    pub source: DecisionSource,
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl CallDecision {
    /// `None` while an `Ask` is still waiting on approval.
    pub fn verdict(&self) -> Option<Verdict> {
        if self.source == DecisionSource::TurnAbort {
            return Some(Verdict::DenyAbort);
        }
        match self.policy {
            PolicyDecision::Allow => Some(Verdict::Allow),
            PolicyDecision::DenyAbort => Some(Verdict::DenyAbort),
            PolicyDecision::DenyContinue => Some(Verdict::DenyContinue),
            PolicyDecision::Ask => self.approval.map(ApprovalResolution::verdict),
        }
    }
}

/// The `execution` field of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionState {
    Scheduled {
        scheduled_at: DateTime<Utc>,
    },
    Succeeded {
        output: Value,
        is_error: bool,
        duration_ms: u64,
    },
    Failed {
        error: String,
        duration_ms: u64,
    },
}

/// Tool name plus arguments, as the agent sent them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub name: String,
    pub arguments: Value,
}

impl ToolCallPayload {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// One record per tool-call attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    call_id: String,
    run_id: RunId,
    agent_id: AgentId,
    payload: ToolCallPayload,
    decision: Option<CallDecision>,
    execution: Option<ExecutionState>,
    state: CallState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ToolCallRecord {
    /// Construct the record for a new call in `PENDING`.
    pub fn new(call_id: impl Into<String>, caller: &CallerContext, payload: ToolCallPayload) -> Self {
        let now = Utc::now();
        Self {
            call_id: call_id.into(),
            run_id: caller.run_id.clone(),
            agent_id: caller.agent_id.clone(),
            payload,
            decision: None,
            execution: None,
            state: CallState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn payload(&self) -> &ToolCallPayload {
        &self.payload
    }

    pub fn decision(&self) -> Option<&CallDecision> {
        self.decision.as_ref()
    }

    pub fn execution(&self) -> Option<&ExecutionState> {
        self.execution.as_ref()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.decision.as_ref().and_then(CallDecision::verdict)
    }

    /// Store the evaluator's decision. Allowed once, while `PENDING`.
    pub fn record_policy(
        &mut self,
        policy: PolicyDecision,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        self.set_decision(policy, DecisionSource::Policy, reason)
    }

    /// Store a fail-closed decision after the evaluator itself errored.
    pub fn record_evaluator_failure(&mut self, detail: String) -> Result<(), TransitionError> {
        self.set_decision(
            PolicyDecision::DenyContinue,
            DecisionSource::EvaluatorFailure,
            Some(detail),
        )
    }

    /// Attach the approval outcome to an `Ask` decision.
    pub fn record_approval(
        &mut self,
        resolution: ApprovalResolution,
        source: DecisionSource,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        self.expect_state(CallState::Pending, CallState::Pending)?;
        let call_id = self.call_id.clone();
        let decision = self
            .decision
            .as_mut()
            .ok_or_else(|| TransitionError::DecisionMismatch {
                call_id: call_id.clone(),
                detail: "approval recorded before policy decision".to_string(),
            })?;
        if decision.policy != PolicyDecision::Ask {
            return Err(TransitionError::DecisionMismatch {
                call_id,
                detail: format!("policy decision is {:?}, not ask", decision.policy),
            });
        }
        if decision.approval.is_some() {
            return Err(TransitionError::DecisionAlreadyRecorded { call_id });
        }
        decision.approval = Some(resolution);
        decision.source = source;
        if reason.is_some() {
            decision.reason = reason;
        }
        decision.decided_at = Utc::now();
        self.touch();
        Ok(())
    }

    /// `PENDING -> EXECUTING`; requires an allow verdict.
    pub fn begin_execution(&mut self) -> Result<(), TransitionError> {
        self.expect_state(CallState::Pending, CallState::Executing)?;
        if self.verdict() != Some(Verdict::Allow) {
            return Err(TransitionError::DecisionMismatch {
                call_id: self.call_id.clone(),
                detail: format!("cannot execute with verdict {:?}", self.verdict()),
            });
        }
        self.execution = Some(ExecutionState::Scheduled {
            scheduled_at: Utc::now(),
        });
        self.state = CallState::Executing;
        self.touch();
        Ok(())
    }

    /// `EXECUTING -> COMPLETED`, for both successful and failed executions.
    pub fn complete(&mut self, outcome: ExecutionState) -> Result<(), TransitionError> {
        self.expect_state(CallState::Executing, CallState::Completed)?;
        if matches!(outcome, ExecutionState::Scheduled { .. }) {
            return Err(TransitionError::DecisionMismatch {
                call_id: self.call_id.clone(),
                detail: "completion must carry a result".to_string(),
            });
        }
        self.execution = Some(outcome);
        self.state = CallState::Completed;
        self.touch();
        Ok(())
    }

    /// `PENDING -> DENIED`; requires a deny verdict.
    pub fn deny(&mut self) -> Result<(), TransitionError> {
        self.expect_state(CallState::Pending, CallState::Denied)?;
        match self.verdict() {
            Some(Verdict::DenyAbort) | Some(Verdict::DenyContinue) => {}
            other => {
                return Err(TransitionError::DecisionMismatch {
                    call_id: self.call_id.clone(),
                    detail: format!("cannot deny with verdict {:?}", other),
                })
            }
        }
        self.state = CallState::Denied;
        self.touch();
        Ok(())
    }

    /// `PENDING -> DENIED` for a call that was ruled on but whose turn was
    /// aborted before it started executing. Overrides an allow verdict.
    pub fn record_turn_abort(&mut self, reason: String) -> Result<(), TransitionError> {
        self.expect_state(CallState::Pending, CallState::Denied)?;
        let call_id = self.call_id.clone();
        let decision = self
            .decision
            .as_mut()
            .ok_or_else(|| TransitionError::DecisionMismatch {
                call_id,
                detail: "turn abort recorded before policy decision".to_string(),
            })?;
        decision.source = DecisionSource::TurnAbort;
        decision.reason = Some(reason);
        decision.decided_at = Utc::now();
        self.state = CallState::Denied;
        self.touch();
        Ok(())
    }

    fn set_decision(
        &mut self,
        policy: PolicyDecision,
        source: DecisionSource,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        self.expect_state(CallState::Pending, CallState::Pending)?;
        if self.decision.is_some() {
            return Err(TransitionError::DecisionAlreadyRecorded {
                call_id: self.call_id.clone(),
            });
        }
        self.decision = Some(CallDecision {
            policy,
            approval: None,
            source,
            reason,
            decided_at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    fn expect_state(&self, required: CallState, to: CallState) -> Result<(), TransitionError> {
        let legal = self.state == required
            && (required == to || self.state.can_transition_to(to));
        if legal {
            Ok(())
        } else {
            Err(TransitionError::IllegalState {
                call_id: self.call_id.clone(),
                from: self.state,
                to,
            })
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Durable storage for tool-call records, keyed by call id.
///
/// `create` is called exactly once per call and must reject a second record
/// for the same id; every later change goes through `update`.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn create(&self, record: &ToolCallRecord) -> McpResult<()>;

    async fn update(&self, record: &ToolCallRecord) -> McpResult<()>;

    async fn get(&self, call_id: &str) -> McpResult<Option<ToolCallRecord>>;

    async fn list_for_run(&self, run_id: &RunId) -> McpResult<Vec<ToolCallRecord>>;
}

/// In-memory [`RecordStore`].
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: DashMap<String, ToolCallRecord>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create(&self, record: &ToolCallRecord) -> McpResult<()> {
        match self.records.entry(record.call_id().to_string()) {
            Entry::Occupied(_) => Err(McpError::DuplicateRecord(record.call_id().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, record: &ToolCallRecord) -> McpResult<()> {
        match self.records.get_mut(record.call_id()) {
            Some(mut stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(McpError::RecordNotFound(record.call_id().to_string())),
        }
    }

    async fn get(&self, call_id: &str) -> McpResult<Option<ToolCallRecord>> {
        Ok(self.records.get(call_id).map(|r| r.value().clone()))
    }

    async fn list_for_run(&self, run_id: &RunId) -> McpResult<Vec<ToolCallRecord>> {
        let mut records: Vec<ToolCallRecord> = self
            .records
            .iter()
            .filter(|r| r.run_id() == run_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn test_record(call_id: &str) -> ToolCallRecord {
        let caller = CallerContext::new("agent", RunId::new("run-1"));
        ToolCallRecord::new(
            call_id,
            &caller,
            ToolCallPayload::new("mcp/fs/read", json!({"path": "/tmp"})),
        )
    }

    #[test]
    fn test_allow_path() {
        let mut record = test_record("c1");
        assert_eq!(record.state(), CallState::Pending);
        assert!(record.decision().is_none());
        assert!(record.execution().is_none());

        record.record_policy(PolicyDecision::Allow, None).unwrap();
        record.begin_execution().unwrap();
        assert_eq!(record.state(), CallState::Executing);
        assert!(matches!(
            record.execution(),
            Some(ExecutionState::Scheduled { .. })
        ));

        record
            .complete(ExecutionState::Succeeded {
                output: json!([]),
                is_error: false,
                duration_ms: 3,
            })
            .unwrap();
        assert_eq!(record.state(), CallState::Completed);
        assert!(record.state().is_terminal());
    }

    #[test]
    fn test_deny_requires_deny_verdict() {
        let mut record = test_record("c1");
        record.record_policy(PolicyDecision::Allow, None).unwrap();
        assert!(record.deny().is_err());
        assert_eq!(record.state(), CallState::Pending);
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        let mut record = test_record("c1");
        record
            .record_policy(PolicyDecision::DenyContinue, Some("nope".to_string()))
            .unwrap();
        record.deny().unwrap();

        assert!(matches!(
            record.begin_execution(),
            Err(TransitionError::IllegalState {
                from: CallState::Denied,
                ..
            })
        ));
        assert!(record.deny().is_err());
        assert!(record
            .record_policy(PolicyDecision::Allow, None)
            .is_err());
        assert_eq!(record.state(), CallState::Denied);
    }

    #[test]
    fn test_decision_is_immutable() {
        let mut record = test_record("c1");
        record.record_policy(PolicyDecision::Ask, None).unwrap();
        assert!(matches!(
            record.record_policy(PolicyDecision::Allow, None),
            Err(TransitionError::DecisionAlreadyRecorded { .. })
        ));
        assert_eq!(record.verdict(), None);

        record
            .record_approval(ApprovalResolution::DeniedAbort, DecisionSource::Human, None)
            .unwrap();
        assert_eq!(record.verdict(), Some(Verdict::DenyAbort));
        assert!(record
            .record_approval(ApprovalResolution::Approved, DecisionSource::Human, None)
            .is_err());
    }

    #[test]
    fn test_approval_without_ask_rejected() {
        let mut record = test_record("c1");
        record.record_policy(PolicyDecision::Allow, None).unwrap();
        assert!(record
            .record_approval(ApprovalResolution::Approved, DecisionSource::Human, None)
            .is_err());
    }

    #[test]
    fn test_complete_requires_executing() {
        let mut record = test_record("c1");
        let err = record
            .complete(ExecutionState::Failed {
                error: "x".to_string(),
                duration_ms: 0,
            })
            .unwrap_err();
        assert!(matches!(err, TransitionError::IllegalState { .. }));
    }

    #[test]
    fn test_evaluator_failure_denies() {
        let mut record = test_record("c1");
        record
            .record_evaluator_failure("engine crashed".to_string())
            .unwrap();
        assert_eq!(record.verdict(), Some(Verdict::DenyContinue));
        assert_eq!(
            record.decision().unwrap().source,
            DecisionSource::EvaluatorFailure
        );
        record.deny().unwrap();
    }

    #[test]
    fn test_turn_abort_overrides_approval() {
        let mut record = test_record("c1");
        assert!(record.record_turn_abort("early".to_string()).is_err());

        record.record_policy(PolicyDecision::Ask, None).unwrap();
        record
            .record_approval(ApprovalResolution::Approved, DecisionSource::Human, None)
            .unwrap();
        record
            .record_turn_abort("sibling call denied".to_string())
            .unwrap();

        assert_eq!(record.state(), CallState::Denied);
        assert_eq!(record.verdict(), Some(Verdict::DenyAbort));
        let decision = record.decision().unwrap();
        assert_eq!(decision.source, DecisionSource::TurnAbort);
        assert_eq!(decision.approval, Some(ApprovalResolution::Approved));
        assert!(record.begin_execution().is_err());
        assert!(record.record_turn_abort("again".to_string()).is_err());
    }

    #[tokio::test]
    async fn test_store_rejects_duplicate_create() {
        let store = InMemoryRecordStore::new();
        let record = test_record("c1");
        store.create(&record).await.unwrap();

        let err = store.create(&record).await.unwrap_err();
        assert!(matches!(err, McpError::DuplicateRecord(id) if id == "c1"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_update_in_place() {
        let store = InMemoryRecordStore::new();
        let mut record = test_record("c1");
        store.create(&record).await.unwrap();

        record.record_policy(PolicyDecision::Allow, None).unwrap();
        record.begin_execution().unwrap();
        store.update(&record).await.unwrap();

        let stored = store.get("c1").await.unwrap().unwrap();
        assert_eq!(stored.state(), CallState::Executing);
        assert_eq!(store.len(), 1);

        let missing = test_record("other");
        assert!(matches!(
            store.update(&missing).await,
            Err(McpError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_for_run() {
        let store = InMemoryRecordStore::new();
        store.create(&test_record("a")).await.unwrap();
        store.create(&test_record("b")).await.unwrap();

        let records = store.list_for_run(&RunId::new("run-1")).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(store
            .list_for_run(&RunId::new("run-2"))
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_value(CallState::Executing).unwrap(),
            json!("EXECUTING")
        );
    }
}
