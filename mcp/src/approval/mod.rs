//! Policy evaluation, human approval and decision auditing.

pub mod audit;
pub mod hub;
pub mod policy;

pub use audit::{AuditEntry, AuditLog, DecisionResult};
pub use hub::{
    ApprovalEvent, ApprovalHub, ApprovalItem, ApprovalObserver, ApprovalResolution, ApprovalStatus,
    AwaitOutcome,
};
pub use policy::{
    PolicyDecision, PolicyEngine, PolicyError, PolicyEvaluator, PolicyOutcome, PolicyRule,
    RulePattern,
};
