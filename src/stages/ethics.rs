//! Stage 8: ethics review.
//!
//! Screens the query and the working answer for ethical risk and records
//! the approval verdict the compliance engine inspects. A denied
//! approval is not an error here — containment is the compliance
//! engine's call, made on this stage's output.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::plugins::dispatch::DispatchPolicy;
use crate::stages::{query_of, Stage, StageContext, StageError, StageProfile, StageResult};
use crate::utils::{json_map, JsonMap};

pub struct EthicsStage {
    profile: StageProfile,
}

impl Default for EthicsStage {
    fn default() -> Self {
        Self::new()
    }
}

impl EthicsStage {
    pub fn new() -> Self {
        Self {
            profile: StageProfile::new(8, "Ethics Review")
                .confidence_threshold(0.9995)
                .safety_critical(),
        }
    }
}

#[async_trait]
impl Stage for EthicsStage {
    fn profile(&self) -> &StageProfile {
        &self.profile
    }

    async fn process(
        &self,
        input: &JsonMap,
        state: &mut JsonMap,
        ctx: &StageContext,
    ) -> Result<StageResult, StageError> {
        let query = query_of(input).to_string();

        let ka_outputs = ctx
            .dispatch
            .dispatch(
                &ctx.plugins,
                self.profile.number,
                DispatchPolicy::PriorityOrder,
                input,
                state,
            )
            .await;
        let screen = ka_outputs
            .into_iter()
            .next()
            .filter(|o| o.is_usable())
            .map(|o| o.output)
            .unwrap_or_else(|| json!({"risk_level": "low", "risk_terms": []}));

        let risk_level = screen["risk_level"].as_str().unwrap_or("low").to_string();
        let approved = risk_level != "critical";

        let confidence = match risk_level.as_str() {
            "low" => 0.9993,
            "medium" => 0.993,
            "high" => 0.985,
            _ => 0.2,
        };

        let mut output = json_map([
            ("query", json!(query)),
            ("ethically_approved", json!(approved)),
            (
                "ethical_risks",
                json!({
                    "risk_level": risk_level,
                    "terms": screen.get("risk_terms").cloned().unwrap_or(Value::Null),
                }),
            ),
        ]);
        if !approved {
            output.insert(
                "ethical_decision".to_string(),
                json!({
                    "approved": false,
                    "reason": "critical risk indicators in query",
                }),
            );
        }

        state.insert(
            "ethics".to_string(),
            json!({"approved": approved, "risk_level": risk_level}),
        );

        let escalate = self.profile.should_escalate(confidence, None);
        Ok(StageResult::new(output, confidence)
            .escalate(escalate)
            .with_trace(json_map([("entropy", json!(0.03))])))
    }
}
