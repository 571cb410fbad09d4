//! Stage 10: emergence scan and final consolidation.
//!
//! The last rung of the ladder. Scans the run for emergence signals
//! (runaway memory churn, suspicious state flags); when the run is
//! stable it consolidates everything into the final answer at full
//! confidence so the executor can complete.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::stages::{query_of, Stage, StageContext, StageError, StageProfile, StageResult};
use crate::utils::{json_map, JsonMap};

/// Fork count in one run beyond which emergence is suspected.
const FORK_EMERGENCE_LIMIT: usize = 5;

pub struct ContainmentStage {
    profile: StageProfile,
}

impl Default for ContainmentStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainmentStage {
    pub fn new() -> Self {
        Self {
            profile: StageProfile::new(10, "Emergence & Containment")
                .confidence_threshold(1.0)
                .safety_critical(),
        }
    }
}

#[async_trait]
impl Stage for ContainmentStage {
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

        let stats = ctx.memory.stats();
        let suspected = state
            .get("emergence_suspected")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let emergent = suspected || stats.n_forks > FORK_EMERGENCE_LIMIT;

        if emergent {
            // Emit the indicator and let the compliance engine contain.
            let output = json_map([
                ("query", json!(query)),
                ("emergence_indicators_present", json!(true)),
                (
                    "emergence_analysis",
                    json!({
                        "emergence_detected": true,
                        "fork_count": stats.n_forks,
                        "suspected_flag": suspected,
                    }),
                ),
            ]);
            return Ok(StageResult::new(output, 0.3)
                .escalate(true)
                .with_trace(json_map([("entropy", json!(0.5))])));
        }

        let answer = state
            .get("synthesis")
            .and_then(|s| s.get("answer"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("consolidated assessment of '{query}'"));

        let stage_summary = json!({
            "entry": state.get("entry_analysis").cloned().unwrap_or(Value::Null),
            "gate": state.get("gate").cloned().unwrap_or(Value::Null),
            "ethics": state.get("ethics").cloned().unwrap_or(Value::Null),
            "verification": state.get("verification").cloned().unwrap_or(Value::Null),
        });

        // The stable terminal answer is written back as a verified cell
        // so an identical later query can be served from memory.
        let cell = ctx.memory.patch(
            &ctx.coordinate,
            json!({"query": query, "answer": answer}),
            json_map([
                ("persona", json!("system")),
                ("verified_answer", json!(answer)),
                ("stage", json!(self.profile.number)),
            ]),
            None,
        );

        Ok(StageResult::new(
            json_map([
                ("query", json!(query)),
                ("final_answer", json!(answer)),
                ("stage_summary", stage_summary),
                ("stability_verified", json!(true)),
            ]),
            1.0,
        )
        .escalate(false)
        .with_trace(json_map([("entropy", json!(0.0))]))
        .with_patches(vec![json!({
            "coordinate": ctx.coordinate.encode(),
            "cell_id": cell.cell_id,
            "operation": "final_answer",
        })]))
    }
}
