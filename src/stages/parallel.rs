//! Stage 7: parallel hypothesis processing.
//!
//! Evaluates alternative readings of the synthesized answer concurrently
//! and checks that the branches stay coherent. Branch scores are
//! deterministic functions of the query so runs are reproducible.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::stages::{query_of, Stage, StageContext, StageError, StageProfile, StageResult};
use crate::utils::{json_map, JsonMap};

/// Spread between the best and worst branch beyond which the ensemble is
/// considered decoherent.
const COHERENCE_SPREAD: f64 = 0.05;

pub struct ParallelHypothesisStage {
    profile: StageProfile,
    branches: usize,
}

impl Default for ParallelHypothesisStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelHypothesisStage {
    pub fn new() -> Self {
        Self {
            profile: StageProfile::new(7, "Parallel Hypothesis")
                .confidence_threshold(0.999)
                .safety_critical(),
            branches: 3,
        }
    }

    async fn evaluate_branch(query: String, index: usize) -> Value {
        // Deterministic per-branch jitter from the query digest.
        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        hasher.update([index as u8]);
        let digest = hasher.finalize();
        let jitter = f64::from(digest[0]) / 255.0 * 0.02;
        let score = 0.95 + jitter;
        json!({
            "branch": index,
            "hypothesis": format!("reading {index} of '{query}'"),
            "score": score,
        })
    }
}

#[async_trait]
impl Stage for ParallelHypothesisStage {
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

        let branches = join_all(
            (0..self.branches).map(|i| Self::evaluate_branch(query.clone(), i)),
        )
        .await;

        let scores: Vec<f64> = branches
            .iter()
            .filter_map(|b| b.get("score").and_then(Value::as_f64))
            .collect();
        let best = scores.iter().copied().fold(f64::MIN, f64::max);
        let worst = scores.iter().copied().fold(f64::MAX, f64::min);
        let spread = best - worst;
        let decoherent = spread > COHERENCE_SPREAD
            || state
                .get("force_decoherence")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        let mean = scores.iter().sum::<f64>() / scores.len().max(1) as f64;

        state.insert(
            "branches".to_string(),
            json!({"count": branches.len(), "spread": spread}),
        );

        let mut output = json_map([
            ("query", json!(query)),
            ("branches", Value::Array(branches)),
            ("branch_spread", json!(spread)),
        ]);
        if decoherent {
            // The compliance engine treats decoherence as an AGI-safety
            // indicator; surfacing it here hands the decision over.
            output.insert(
                "quantum_answer".to_string(),
                json!({"decoherence_detected": true, "spread": spread}),
            );
        }

        let confidence = if decoherent { 0.4 } else { mean.min(0.998) };
        let escalate = self.profile.should_escalate(confidence, Some(spread));
        Ok(StageResult::new(output, confidence)
            .escalate(escalate)
            .with_trace(json_map([("entropy", json!(spread))])))
    }
}
