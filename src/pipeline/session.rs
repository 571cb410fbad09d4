//! Session, per-stage records, and trace steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::coordinate::Coordinate;
use crate::utils::JsonMap;

/// Lifecycle of one simulation session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Ready,
    Running,
    Paused,
    Completed,
    Contained,
    Failed,
}

impl SessionStatus {
    /// Terminal sessions are immutable except for annotation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Contained | Self::Failed)
    }
}

/// Status of one committed stage execution.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Ready,
    Running,
    Completed,
    Escalated,
    Contained,
    Failed,
}

/// Closed vocabulary of trace step kinds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceEventKind {
    SimulationStart,
    LayerEntry,
    LayerExit,
    AgentSpawn,
    AgentAction,
    MemoryPatch,
    ForkDetected,
    Escalation,
    Containment,
    ComplianceCheck,
    AuditEvent,
}

/// Confidence snapshot for one stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub stage: u8,
    pub score: f64,
    /// Change from the previous stage's score.
    pub delta: f64,
    pub entropy: Option<f64>,
}

/// One entry in the ordered event log of a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceStep {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub stage: u8,
    pub stage_name: String,
    pub kind: TraceEventKind,
    pub message: String,
    pub confidence: ConfidenceScore,
    pub input_snapshot: JsonMap,
    pub output_snapshot: JsonMap,
    pub agent: Option<String>,
    pub persona: Option<String>,
}

/// The committed record of one stage's execution within a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageState {
    pub stage: u8,
    pub name: String,
    pub status: StageStatus,
    pub trace: Vec<TraceStep>,
    pub agents: Vec<String>,
    pub confidence: ConfidenceScore,
    pub forked: bool,
    pub escalation: bool,
    pub patches: Vec<Value>,
}

/// What the caller asked the pipeline to reason about.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationQuery {
    pub query: String,
    pub context: JsonMap,
    pub coordinate: Option<Coordinate>,
}

impl SimulationQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            context: JsonMap::new(),
            coordinate: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: JsonMap) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_coordinate(mut self, coordinate: Coordinate) -> Self {
        self.coordinate = Some(coordinate);
        self
    }
}

/// One simulation run.
///
/// `stages` stays stage-number-sorted; once the status is terminal the
/// session is immutable except for [`annotations`](Self::annotations).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub status: SessionStatus,
    /// Stage number of the last committed stage; 0 while READY.
    pub current_stage: u8,
    pub query: SimulationQuery,
    pub stages: Vec<StageState>,
    pub state: JsonMap,
    pub final_output: Option<JsonMap>,
    /// Post-hoc notes; the only field writable after a terminal status.
    pub annotations: JsonMap,
}

impl Session {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append a stage record, maintaining the stage-number ordering
    /// invariant. Records arriving out of order are rejected.
    pub fn push_stage(&mut self, stage: StageState) -> bool {
        if let Some(last) = self.stages.last() {
            if stage.stage <= last.stage {
                return false;
            }
        }
        self.current_stage = stage.stage;
        self.stages.push(stage);
        true
    }

    pub fn last_stage(&self) -> Option<&StageState> {
        self.stages.last()
    }

    /// All trace steps across stages, in commit order.
    pub fn full_trace(&self) -> Vec<TraceStep> {
        self.stages.iter().flat_map(|s| s.trace.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_state(number: u8) -> StageState {
        StageState {
            stage: number,
            name: format!("stage {number}"),
            status: StageStatus::Completed,
            trace: Vec::new(),
            agents: Vec::new(),
            confidence: ConfidenceScore {
                stage: number,
                score: 0.9,
                delta: 0.0,
                entropy: None,
            },
            forked: false,
            escalation: false,
            patches: Vec::new(),
        }
    }

    fn session() -> Session {
        Session {
            id: "s".into(),
            run_id: "r".into(),
            created_at: Utc::now(),
            user_id: None,
            status: SessionStatus::Ready,
            current_stage: 0,
            query: SimulationQuery::new("q"),
            stages: Vec::new(),
            state: JsonMap::new(),
            final_output: None,
            annotations: JsonMap::new(),
        }
    }

    #[test]
    fn stages_stay_number_sorted() {
        let mut session = session();
        assert!(session.push_stage(stage_state(1)));
        assert!(session.push_stage(stage_state(2)));
        assert!(!session.push_stage(stage_state(2)));
        assert!(!session.push_stage(stage_state(1)));
        assert_eq!(session.current_stage, 2);
        let numbers: Vec<u8> = session.stages.iter().map(|s| s.stage).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn terminal_statuses_are_recognized() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Contained.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }

    #[test]
    fn statuses_serialize_upper_snake() {
        let s = serde_json::to_value(SessionStatus::Contained).unwrap();
        assert_eq!(s, serde_json::json!("CONTAINED"));
        let k = serde_json::to_value(TraceEventKind::LayerEntry).unwrap();
        assert_eq!(k, serde_json::json!("LAYER_ENTRY"));
    }
}
