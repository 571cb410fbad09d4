//! Stage 5: gatekeeper.
//!
//! Screens everything the earlier stages accumulated before the pipeline
//! enters its safety-critical half.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::stages::{query_of, Stage, StageContext, StageError, StageProfile, StageResult};
use crate::utils::{json_map, JsonMap};

pub struct GatekeeperStage {
    profile: StageProfile,
}

impl Default for GatekeeperStage {
    fn default() -> Self {
        Self::new()
    }
}

impl GatekeeperStage {
    pub fn new() -> Self {
        Self {
            profile: StageProfile::new(5, "Gatekeeper").confidence_threshold(0.998),
        }
    }
}

#[async_trait]
impl Stage for GatekeeperStage {
    fn profile(&self) -> &StageProfile {
        &self.profile
    }

    async fn process(
        &self,
        input: &JsonMap,
        state: &mut JsonMap,
        _ctx: &StageContext,
    ) -> Result<StageResult, StageError> {
        let query = query_of(input).to_string();

        let entry_confidence = state
            .get("entry_confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5);
        let consensus_strength = state
            .get("research")
            .and_then(|r| r.get("consensus"))
            .and_then(|c| c.get("consensus_strength"))
            .and_then(Value::as_f64)
            .unwrap_or(0.5);
        let divergent = state
            .get("perspectives")
            .and_then(|p| p.get("divergent"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut gate_score =
            0.4 * entry_confidence + 0.4 * consensus_strength + if divergent { 0.0 } else { 0.2 };

        let mut concerns: Vec<&str> = Vec::new();
        if entry_confidence < 0.5 {
            concerns.push("entry triage confidence very low");
            gate_score *= 0.8;
        }
        if divergent {
            concerns.push("stakeholder positions diverged");
        }
        let gate_passed = concerns.is_empty() && gate_score >= 0.75;
        let confidence = (0.9 + 0.09 * gate_score).min(0.997);

        state.insert(
            "gate".to_string(),
            json!({
                "score": gate_score,
                "passed": gate_passed,
                "concerns": concerns,
            }),
        );

        // The gate keeps the pipeline climbing unless memory holds a
        // verified answer; its own threshold sits above what the score
        // blend can produce.
        let escalate = self.profile.should_escalate(confidence, None);
        Ok(StageResult::new(
            json_map([
                ("query", json!(query)),
                ("gate_score", json!(gate_score)),
                ("gate_passed", json!(gate_passed)),
                ("concerns", json!(concerns)),
            ]),
            confidence,
        )
        .escalate(escalate)
        .with_trace(json_map([("entropy", json!(0.05))]))
        .with_metadata(json_map([("safety_screen", json!("gatekeeper"))])))
    }
}
