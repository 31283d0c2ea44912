//! Agent and run identifiers.
//!
//! Every record, approval item and subscription key carries the agent it
//! belongs to, so lookups never fall back to a process-global namespace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies the agent a call or subscription belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies one run (session) of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who is calling: passed to the policy evaluator and stamped on records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallerContext {
    pub agent_id: AgentId,
    pub run_id: RunId,
}

impl CallerContext {
    pub fn new(agent_id: impl Into<AgentId>, run_id: RunId) -> Self {
        Self {
            agent_id: agent_id.into(),
            run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_serializes_as_plain_string() {
        let id = AgentId::new("agent-7");
        assert_eq!(serde_json::to_value(&id).unwrap(), "agent-7");
        assert_eq!(id.to_string(), "agent-7");
    }

    #[test]
    fn test_run_ids_are_unique_by_default() {
        assert_ne!(RunId::default(), RunId::default());
    }
}
