//! Stage 6: synthesis.
//!
//! Folds the accumulated stage outputs into one coherent answer
//! candidate using a deep merge, with a reasoning KA assist when one is
//! bound.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::plugins::dispatch::DispatchPolicy;
use crate::stages::{query_of, Stage, StageContext, StageError, StageProfile, StageResult};
use crate::utils::json_ext::{deep_merge, MergeStrategy};
use crate::utils::{json_map, JsonMap};

pub struct SynthesisStage {
    profile: StageProfile,
}

impl Default for SynthesisStage {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthesisStage {
    pub fn new() -> Self {
        Self {
            profile: StageProfile::new(6, "Synthesis")
                .confidence_threshold(0.998)
                .safety_critical(),
        }
    }
}

#[async_trait]
impl Stage for SynthesisStage {
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

        // Merge what the ladder has accumulated so far; a scalar clash
        // falls back to preferring the most recent reading.
        let accumulated = Value::Object(state.clone());
        let current = Value::Object(input.clone());
        let merged = deep_merge(&accumulated, &current, MergeStrategy::Deep)
            .unwrap_or_else(|_| {
                deep_merge(&accumulated, &current, MergeStrategy::PreferRight)
                    .unwrap_or(Value::Object(input.clone()))
            });

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
        let ka_assist = ka_outputs.into_iter().next().filter(|o| o.is_usable());

        let research_answers: Vec<String> = input
            .get("research_findings")
            .and_then(Value::as_array)
            .map(|findings| {
                findings
                    .iter()
                    .filter_map(|f| f.get("answer").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let synthesized_answer = if research_answers.is_empty() {
            format!("synthesized assessment of '{query}'")
        } else {
            research_answers.join("; ")
        };

        let consensus_strength = state
            .get("research")
            .and_then(|r| r.get("consensus"))
            .and_then(|c| c.get("consensus_strength"))
            .and_then(Value::as_f64)
            .unwrap_or(0.6);
        let ka_bonus = ka_assist.as_ref().map_or(0.0, |o| 0.02 * o.confidence);
        let confidence = (0.9 + 0.06 * consensus_strength + ka_bonus).min(0.997);

        state.insert(
            "synthesis".to_string(),
            json!({"answer": synthesized_answer, "confidence": confidence}),
        );

        let escalate = self.profile.should_escalate(confidence, Some(0.04));
        Ok(StageResult::new(
            json_map([
                ("query", json!(query)),
                ("synthesized_answer", json!(synthesized_answer)),
                ("merged_context", merged),
                (
                    "ka_assist",
                    ka_assist.map_or(Value::Null, |o| o.output),
                ),
            ]),
            confidence,
        )
        .escalate(escalate)
        .with_trace(json_map([("entropy", json!(0.04))])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::tests_support::{context, input_for};

    #[tokio::test]
    async fn synthesis_merges_state_and_input() {
        let ctx = context();
        let mut state = json_map([
            ("research", json!({"consensus": {"consensus_strength": 0.9}})),
            ("entry_analysis", json!({"complexity": "low"})),
        ]);
        let mut input = input_for("combine the findings");
        input.insert(
            "research_findings".to_string(),
            json!([
                {"answer": "finding one", "confidence": 0.9},
                {"answer": "finding two", "confidence": 0.8},
            ]),
        );
        let result = SynthesisStage::new()
            .process(&input, &mut state, &ctx)
            .await
            .unwrap();
        let answer = result.output["synthesized_answer"].as_str().unwrap();
        assert!(answer.contains("finding one"));
        assert!(answer.contains("finding two"));
        assert!(result.output["merged_context"]["entry_analysis"].is_object());
        assert!(state.contains_key("synthesis"));
    }

    #[tokio::test]
    async fn bare_input_still_synthesizes() {
        let ctx = context();
        let mut state = JsonMap::new();
        let result = SynthesisStage::new()
            .process(&input_for("lonely query"), &mut state, &ctx)
            .await
            .unwrap();
        assert!(result.output["synthesized_answer"]
            .as_str()
            .unwrap()
            .contains("lonely query"));
        assert!(result.escalate);
    }
}
