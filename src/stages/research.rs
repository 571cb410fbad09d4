//! Stage 3: research panel.
//!
//! Runs the attached research agents as a team, folds their reports into
//! a consensus, and patches the findings into shared memory.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::audit::AuditEventType;
use crate::stages::{
    query_of, AgentRequisition, Stage, StageContext, StageError, StageProfile, StageResult,
};
use crate::utils::{json_map, JsonMap};

pub struct ResearchStage {
    profile: StageProfile,
}

impl Default for ResearchStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ResearchStage {
    pub fn new() -> Self {
        Self {
            profile: StageProfile::new(3, "Research Panel")
                .confidence_threshold(0.995)
                .requires_agents(),
        }
    }
}

#[async_trait]
impl Stage for ResearchStage {
    fn profile(&self) -> &StageProfile {
        &self.profile
    }

    fn agent_requisition(&self) -> Option<AgentRequisition> {
        Some(AgentRequisition::Research {
            count: 3,
            specializations: None,
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
                what: "attached research agents",
            });
        }
        let query = query_of(input).to_string();

        let team_id = ctx
            .agents
            .create_team(&ctx.attached_agents, Some(&format!("research_{}", ctx.run_id)));
        let team = ctx.agents.run_team(&team_id, input, state).await?;

        let consensus = &team.consensus;
        // Team confidence carries, discounted when the panel disagrees.
        let confidence =
            (team.team_confidence() * (0.85 + 0.15 * consensus.consensus_strength)).min(0.999);
        let entropy = consensus.confidence_variance.min(1.0);

        let findings: Vec<Value> = team
            .agent_reports
            .iter()
            .map(|r| {
                json!({
                    "agent_id": r.agent_id,
                    "persona": r.persona,
                    "answer": r.answer,
                    "confidence": r.confidence,
                })
            })
            .collect();

        // Findings land in shared memory under the research persona.
        let cell = ctx.memory.patch(
            &ctx.coordinate,
            json!({"query": query, "findings": findings}),
            json_map([
                ("persona", json!("research_panel")),
                ("stage", json!(self.profile.number)),
            ]),
            None,
        );

        ctx.audit
            .entry(
                AuditEventType::AgentDecision,
                json_map([
                    ("team_id", json!(team.team_id)),
                    ("team_confidence", json!(consensus.team_confidence)),
                    ("consensus_strength", json!(consensus.consensus_strength)),
                    ("agreement", serde_json::to_value(consensus.agreement).unwrap_or_default()),
                ]),
            )
            .stage(self.profile.number)
            .simulation_id(&ctx.session_id)
            .append();

        state.insert(
            "research".to_string(),
            json!({
                "team_id": team.team_id,
                "consensus": serde_json::to_value(consensus).unwrap_or_default(),
            }),
        );

        let escalate = self.profile.should_escalate(confidence, Some(entropy));
        Ok(StageResult::new(
            json_map([
                ("query", json!(query)),
                ("research_findings", Value::Array(findings)),
                (
                    "consensus",
                    serde_json::to_value(consensus).unwrap_or_default(),
                ),
            ]),
            confidence,
        )
        .escalate(escalate)
        .with_trace(json_map([
            ("entropy", json!(entropy)),
            ("team_id", json!(team.team_id)),
        ]))
        .with_patches(vec![json!({
            "coordinate": ctx.coordinate.encode(),
            "cell_id": cell.cell_id,
            "operation": "research_findings",
        })])
        .with_agents_spawned(ctx.attached_agents.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::stages::tests_support::{context, input_for};

    #[tokio::test]
    async fn panel_reaches_consensus_and_patches_memory() {
        let base = context();
        let ids = base.agents.spawn_research(3, &base.coordinate, None);
        let ctx = base.with_attached_agents(ids.clone());
        let mut state = JsonMap::new();
        let result = ResearchStage::new()
            .process(&input_for("assess the migration"), &mut state, &ctx)
            .await
            .unwrap();

        assert_eq!(result.agents_spawned, ids);
        assert!(result.escalate); // research alone rarely clears 0.995
        assert_eq!(result.output["research_findings"].as_array().unwrap().len(), 3);
        assert!(ctx.memory.get(&ctx.coordinate, None).is_some());
        assert!(state.contains_key("research"));
        assert_eq!(
            ctx.audit
                .query(&AuditFilter::event(AuditEventType::AgentDecision), 10, 0)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn missing_agents_is_an_error() {
        let ctx = context();
        let mut state = JsonMap::new();
        let err = ResearchStage::new()
            .process(&input_for("q"), &mut state, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::MissingInput { .. }));
    }
}
