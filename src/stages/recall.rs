//! Stage 2: memory recall.
//!
//! Looks for knowledge already stored at the query coordinate and
//! assembles persona context for the later stages. A verified cached
//! answer short-circuits the run.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::stages::{query_of, Stage, StageContext, StageError, StageProfile, StageResult};
use crate::utils::{json_map, JsonMap};

pub struct RecallStage {
    profile: StageProfile,
}

impl Default for RecallStage {
    fn default() -> Self {
        Self::new()
    }
}

impl RecallStage {
    pub fn new() -> Self {
        Self {
            profile: StageProfile::new(2, "Memory Recall").confidence_threshold(0.8),
        }
    }
}

#[async_trait]
impl Stage for RecallStage {
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
        let cell = ctx.memory.get(&ctx.coordinate, None);

        // A verified prior answer at this coordinate ends the run here.
        if let Some(cell) = &cell {
            if let Some(answer) = cell.meta.get("verified_answer").cloned() {
                state.insert("recall_hit".to_string(), json!(true));
                return Ok(StageResult::new(
                    json_map([
                        ("query", json!(query)),
                        ("answer", answer),
                        ("source_cell", json!(cell.cell_id)),
                        ("cached", json!(true)),
                    ]),
                    0.996,
                )
                .with_trace(json_map([("entropy", json!(cell.entropy()))])));
            }
        }

        let system_context = ctx.memory.find_by_persona("system");
        let context_cells: Vec<Value> = system_context
            .iter()
            .map(|c| json!({"cell_id": c.cell_id, "coordinate": c.coordinate.encode()}))
            .collect();

        // Record the recall pass on the live cell so later stages can see
        // the coordinate has been visited.
        let mut patches = Vec::new();
        if let Some(cell) = &cell {
            let patched = ctx.memory.patch(
                &ctx.coordinate,
                cell.value.clone(),
                json_map([
                    ("recalled_by", json!(ctx.run_id)),
                    ("persona", json!("system")),
                ]),
                None,
            );
            patches.push(json!({
                "coordinate": ctx.coordinate.encode(),
                "cell_id": patched.cell_id,
                "operation": "recall_mark",
            }));
        }

        let coverage = if cell.is_some() { 0.85 } else { 0.6 };
        state.insert(
            "memory_context".to_string(),
            json!({
                "cell_present": cell.is_some(),
                "context_cells": context_cells.len(),
            }),
        );

        let escalate = self.profile.should_escalate(coverage, Some(0.05));
        Ok(StageResult::new(
            json_map([
                ("query", json!(query)),
                ("memory_context", Value::Array(context_cells)),
                ("coordinate", json!(ctx.coordinate.encode())),
            ]),
            coverage,
        )
        .escalate(escalate)
        .with_trace(json_map([("entropy", json!(0.05))]))
        .with_patches(patches))
    }
}
