//! Typed message envelopes for session event fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::JsonMap;

/// Closed vocabulary of hub message types.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Simulation events
    SimulationStarted,
    SimulationCompleted,
    SimulationError,
    // Stage events
    LayerStarted,
    LayerCompleted,
    LayerEscalated,
    LayerContained,
    // Agent events
    AgentSpawned,
    AgentAction,
    AgentKilled,
    AgentVote,
    // Memory events
    MemoryPatched,
    MemoryForked,
    // Trace events
    TraceLog,
    AuditEvent,
    // Compliance events
    ConfidenceThreshold,
    ContainmentTriggered,
    ComplianceViolation,
    // Plugin events
    PluginLoaded,
    PluginActivated,
    PluginDeactivated,
    // Client events
    JoinSession,
    LeaveSession,
    Heartbeat,
}

impl MessageType {
    /// Wire name, e.g. `containment_triggered`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimulationStarted => "simulation_started",
            Self::SimulationCompleted => "simulation_completed",
            Self::SimulationError => "simulation_error",
            Self::LayerStarted => "layer_started",
            Self::LayerCompleted => "layer_completed",
            Self::LayerEscalated => "layer_escalated",
            Self::LayerContained => "layer_contained",
            Self::AgentSpawned => "agent_spawned",
            Self::AgentAction => "agent_action",
            Self::AgentKilled => "agent_killed",
            Self::AgentVote => "agent_vote",
            Self::MemoryPatched => "memory_patched",
            Self::MemoryForked => "memory_forked",
            Self::TraceLog => "trace_log",
            Self::AuditEvent => "audit_event",
            Self::ConfidenceThreshold => "confidence_threshold",
            Self::ContainmentTriggered => "containment_triggered",
            Self::ComplianceViolation => "compliance_violation",
            Self::PluginLoaded => "plugin_loaded",
            Self::PluginActivated => "plugin_activated",
            Self::PluginDeactivated => "plugin_deactivated",
            Self::JoinSession => "join_session",
            Self::LeaveSession => "leave_session",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Wire format of every hub message.
///
/// ```
/// use echelon::hub::{Envelope, MessageType};
///
/// let envelope = Envelope::new(MessageType::Heartbeat, "sess-1", Default::default());
/// let wire = serde_json::to_value(&envelope).unwrap();
/// assert_eq!(wire["type"], "heartbeat");
/// assert_eq!(wire["session_id"], "sess-1");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: JsonMap,
    pub message_id: Uuid,
}

impl Envelope {
    pub fn new(message_type: MessageType, session_id: impl Into<String>, data: JsonMap) -> Self {
        Self {
            message_type,
            session_id: session_id.into(),
            timestamp: Utc::now(),
            data,
            message_id: Uuid::new_v4(),
        }
    }

    /// Envelope addressed to every session.
    pub fn global(message_type: MessageType, data: JsonMap) -> Self {
        Self::new(message_type, "*", data)
    }

    /// Compact JSON for the transport.
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
