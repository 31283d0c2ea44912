//! Bounded in-memory audit log of call decisions.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::DenialKind,
    record::DecisionSource,
    scope::{AgentId, RunId},
};

const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// What was decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DecisionResult {
    Allowed,
    Denied { kind: DenialKind, reason: String },
    /// Parked for a human decision.
    Pending,
    TimedOut { kind: DenialKind },
}

impl DecisionResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, DecisionResult::Allowed)
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, DecisionResult::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: AgentId,
    pub run_id: RunId,
    pub call_id: String,
    pub tool_name: String,
    #[serde(flatten)]
    pub result: DecisionResult,
    pub source: DecisionSource,
}

impl AuditEntry {
    pub fn new(
        agent_id: AgentId,
        run_id: RunId,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: DecisionResult,
        source: DecisionSource,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            agent_id,
            run_id,
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            result,
            source,
        }
    }
}

#[derive(Debug)]
pub struct AuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    max_entries: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries.min(1024))),
            max_entries,
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.write();
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.entries.read().iter().rev().take(limit).cloned().collect()
    }

    /// Newest first.
    pub fn for_agent(&self, agent_id: &AgentId, limit: usize) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|e| &e.agent_id == agent_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Oldest first, so the entries read as the call's history.
    pub fn for_call(&self, call_id: &str) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.call_id == call_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
