//! Stage 1: simulation entry.
//!
//! Triage of the incoming query: intent and complexity classification,
//! ambiguity scan, and the initial memory seed at the query coordinate.
//! Simple unambiguous queries finish here; anything else rides the
//! escalation ladder.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::plugins::dispatch::DispatchPolicy;
use crate::stages::{query_of, Stage, StageContext, StageError, StageProfile, StageResult};
use crate::utils::{json_map, JsonMap};

pub struct EntryStage {
    profile: StageProfile,
}

impl Default for EntryStage {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryStage {
    pub fn new() -> Self {
        Self {
            profile: StageProfile::new(1, "Simulation Entry").confidence_threshold(0.75),
        }
    }

    /// Inline triage used when no analyzer KA produced a usable result.
    fn fallback_analysis(query: &str) -> Value {
        let word_count = query.split_whitespace().count();
        let complexity = if word_count > 40 {
            "high"
        } else if word_count > 12 {
            "medium"
        } else {
            "low"
        };
        json!({
            "intent": if query.contains('?') { "interrogative" } else { "declarative" },
            "complexity": complexity,
            "word_count": word_count,
            "ambiguity_markers": [],
        })
    }
}

#[async_trait]
impl Stage for EntryStage {
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
        if query.is_empty() {
            return Err(StageError::MissingInput { what: "query" });
        }

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
        let (analysis, entropy) = match ka_outputs.into_iter().next() {
            Some(out) if out.is_usable() => (out.output, out.entropy),
            _ => (Self::fallback_analysis(&query), 0.05),
        };

        let ambiguous = analysis["ambiguity_markers"]
            .as_array()
            .is_some_and(|m| !m.is_empty());
        let complexity = analysis["complexity"]
            .as_str()
            .unwrap_or("medium")
            .to_string();
        let confidence = match (complexity.as_str(), ambiguous) {
            ("low", false) => 0.996,
            ("low", true) | ("medium", false) => 0.85,
            _ => 0.7,
        };

        // Seed the shared memory graph with the triaged query.
        let cell = ctx.memory.set(
            &ctx.coordinate,
            json!({"query": query, "analysis": analysis}),
            json_map([
                ("persona", json!("system")),
                ("stage", json!(self.profile.number)),
                ("run_id", json!(ctx.run_id)),
            ]),
            None,
        );

        state.insert("entry_analysis".to_string(), analysis.clone());
        state.insert("entry_confidence".to_string(), json!(confidence));

        let escalate = self.profile.should_escalate(confidence, Some(entropy));
        Ok(StageResult::new(
            json_map([
                ("query", json!(query)),
                ("analysis", analysis),
                ("seeded_cell", json!(cell.cell_id)),
            ]),
            confidence,
        )
        .escalate(escalate)
        .with_trace(json_map([
            ("entropy", json!(entropy)),
            ("ambiguous", json!(ambiguous)),
            ("complexity", json!(complexity)),
        ]))
        .with_patches(vec![json!({
            "coordinate": ctx.coordinate.encode(),
            "cell_id": cell.cell_id,
            "operation": "seed",
        })]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::tests_support::{context, input_for};

    #[tokio::test]
    async fn simple_query_completes_with_high_confidence() {
        let ctx = context();
        let mut state = JsonMap::new();
        let result = EntryStage::new()
            .process(&input_for("What is 2+2?"), &mut state, &ctx)
            .await
            .unwrap();
        assert!(result.confidence >= 0.995);
        assert!(!result.escalate);
        assert_eq!(result.patches.len(), 1);
        // The query was seeded into shared memory.
        assert!(ctx.memory.get(&ctx.coordinate, None).is_some());
        assert!(state.contains_key("entry_analysis"));
    }

    #[tokio::test]
    async fn ambiguous_query_escalates() {
        let ctx = context();
        let mut state = JsonMap::new();
        let result = EntryStage::new()
            .process(
                &input_for("Maybe we should migrate, or wait? unclear tradeoffs"),
                &mut state,
                &ctx,
            )
            .await
            .unwrap();
        assert!(result.confidence < 0.995);
        assert!(result.escalate);
    }

    #[tokio::test]
    async fn missing_query_is_an_error() {
        let ctx = context();
        let mut state = JsonMap::new();
        let err = EntryStage::new()
            .process(&JsonMap::new(), &mut state, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::MissingInput { what: "query" }));
    }
}
