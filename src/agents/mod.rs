//! Stage-spawned sub-workers and their lifecycle.
//!
//! An agent is a persona/role pair attached to a coordinate with an
//! async `process` capability. Stages never talk to agents directly;
//! they go through the [`AgentManager`], which owns spawning, teams,
//! deactivation, and per-agent trace logs.

mod manager;
mod roles;
mod team;

pub use manager::{AgentManager, AgentStats, AgentTraceEvent};
pub use roles::{PerspectiveAgent, ResearchAgent, PERSONA_POOL, STAKEHOLDER_POOL};
pub use team::{Agreement, Consensus, TeamReport};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::coordinate::Coordinate;
use crate::utils::JsonMap;

/// Errors surfaced by agents and the manager.
#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    /// An agent could not produce a report for this input.
    #[error("agent '{agent_id}' failed: {message}")]
    #[diagnostic(code(echelon::agents::process))]
    Process { agent_id: String, message: String },

    /// Referenced team does not exist.
    #[error("team not found: {team_id}")]
    #[diagnostic(code(echelon::agents::team_not_found))]
    TeamNotFound { team_id: String },

    /// Referenced agent does not exist.
    #[error("agent not found: {agent_id}")]
    #[diagnostic(code(echelon::agents::agent_not_found))]
    AgentNotFound { agent_id: String },
}

/// Identity and placement of one agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: String,
    pub persona: String,
    pub role: String,
    pub coordinate: Coordinate,
    pub created_at: DateTime<Utc>,
}

/// What one agent returns for one input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub persona: String,
    pub answer: Value,
    pub confidence: f64,
    pub reasoning: String,
    /// Role-specific extras (specialization, stakeholder concerns, ...).
    pub extras: JsonMap,
}

/// A sub-worker spawned by a stage.
#[async_trait]
pub trait Agent: Send + Sync {
    fn profile(&self) -> &AgentProfile;

    /// Produce this agent's contribution for the input.
    async fn process(&self, input: &JsonMap, context: &JsonMap) -> Result<AgentReport, AgentError>;
}

pub(crate) fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}
