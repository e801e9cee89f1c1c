// Agent registry types: heartbeat records and derived liveness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status an agent reports about itself on heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Active,
    Idle,
    Degraded,
    Failed,
    Registered,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Active => "active",
            AgentState::Idle => "idle",
            AgentState::Degraded => "degraded",
            AgentState::Failed => "failed",
            AgentState::Registered => "registered",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(AgentState::Active),
            "idle" => Some(AgentState::Idle),
            "degraded" => Some(AgentState::Degraded),
            "failed" => Some(AgentState::Failed),
            "registered" => Some(AgentState::Registered),
            _ => None,
        }
    }
}

/// Liveness derived by readers from heartbeat age, not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Heartbeat within the last 60 seconds.
    Active,
    /// Heartbeat 60-300 seconds old.
    Degraded,
    /// No heartbeat for over 300 seconds.
    Stale,
}

/// Persisted heartbeat row for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub state: AgentState,
    pub current_task: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_count: i64,
}

/// Registry row augmented with derived liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub record: AgentRecord,
    pub liveness: Liveness,
}
