//! Stage 4: perspective sweep.
//!
//! Stakeholder agents examine the query from their own vantage points.
//! When the sweep runs against an ambiguous query the positions are
//! treated as divergent and the memory cell forks to keep both readings.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::stages::{
    query_of, AgentRequisition, Stage, StageContext, StageError, StageProfile, StageResult,
};
use crate::utils::{json_map, JsonMap};

pub struct PerspectiveStage {
    profile: StageProfile,
}

impl Default for PerspectiveStage {
    fn default() -> Self {
        Self::new()
    }
}

impl PerspectiveStage {
    pub fn new() -> Self {
        Self {
            profile: StageProfile::new(4, "Perspective Sweep")
                .confidence_threshold(0.9)
                .requires_agents(),
        }
    }
}

#[async_trait]
impl Stage for PerspectiveStage {
    fn profile(&self) -> &StageProfile {
        &self.profile
    }

    fn agent_requisition(&self) -> Option<AgentRequisition> {
        Some(AgentRequisition::Perspective {
            stakeholders: ["users", "developers", "regulators", "society"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }

    async fn process(
        &self,
        input: &JsonMap,
        state: &mut JsonMap,
        ctx: &StageContext,
    ) -> Result<StageResult, StageError> {
        if ctx.attached_agents.is_empty() {
            return Err(StageError::MissingInput {
                what: "attached perspective agents",
            });
        }
        let query = query_of(input).to_string();

        let team_id = ctx
            .agents
            .create_team(&ctx.attached_agents, Some(&format!("pov_{}", ctx.run_id)));
        let team = ctx.agents.run_team(&team_id, input, state).await?;

        let positions: Vec<Value> = team
            .agent_reports
            .iter()
            .map(|r| {
                json!({
                    "agent_id": r.agent_id,
                    "stakeholder": r.extras.get("stakeholder_type").cloned().unwrap_or(Value::Null),
                    "position": r.answer,
                    "concerns": r.extras.get("concerns").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();

        // Ambiguity recorded at entry means stakeholders read the query
        // differently; keep both readings via a fork.
        let divergent = state
            .get("entry_analysis")
            .and_then(|a| a.get("ambiguity_markers"))
            .and_then(Value::as_array)
            .is_some_and(|m| !m.is_empty());

        let mut forks = Vec::new();
        if divergent {
            if let Some(child) = ctx.memory.fork(
                &ctx.coordinate,
                json!({"query": query, "positions": positions}),
                json_map([("persona", json!("pov_sweep"))]),
                "stakeholder divergence",
            ) {
                forks.push(json!({
                    "coordinate": ctx.coordinate.encode(),
                    "cell_id": child.cell_id,
                    "parent_cell_id": child.parent_cell_id,
                    "reason": "stakeholder divergence",
                }));
            }
        }

        let confidence = if divergent {
            (team.team_confidence() - 0.1).max(0.0)
        } else {
            (team.team_confidence() + 0.12).min(0.95)
        };
        state.insert(
            "perspectives".to_string(),
            json!({
                "stakeholders": positions.len(),
                "divergent": divergent,
            }),
        );

        let escalate = self.profile.should_escalate(confidence, None);
        Ok(StageResult::new(
            json_map([
                ("query", json!(query)),
                ("stakeholder_positions", Value::Array(positions)),
                ("divergent", json!(divergent)),
            ]),
            confidence,
        )
        .escalate(escalate)
        .with_trace(json_map([("entropy", json!(if divergent { 0.25 } else { 0.05 }))]))
        .with_forks(forks)
        .with_agents_spawned(ctx.attached_agents.clone()))
    }
}
