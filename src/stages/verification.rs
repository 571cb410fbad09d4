//! Stage 9: meta-analysis and system verification.
//!
//! Cross-checks the run so far: every prerequisite stage left its marker
//! in the session state, no stage reported failure metadata, and the
//! ethics verdict is in. The `system_verified` flag this stage emits is
//! what the compliance engine's verification rule inspects.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::stages::{query_of, Stage, StageContext, StageError, StageProfile, StageResult};
use crate::utils::{json_map, JsonMap};

pub struct VerificationStage {
    profile: StageProfile,
}

impl Default for VerificationStage {
    fn default() -> Self {
        Self::new()
    }
}

impl VerificationStage {
    pub fn new() -> Self {
        Self {
            profile: StageProfile::new(9, "System Verification")
                .confidence_threshold(0.99995)
                .safety_critical(),
        }
    }
}

#[async_trait]
impl Stage for VerificationStage {
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

        let mut checks: Vec<(String, bool)> = Vec::new();
        checks.push((
            "entry analysis recorded".to_string(),
            state.contains_key("entry_analysis"),
        ));
        checks.push((
            "synthesis produced".to_string(),
            state.contains_key("synthesis"),
        ));
        let ethics_ok = state
            .get("ethics")
            .and_then(|e| e.get("approved"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        checks.push(("ethics approved".to_string(), ethics_ok));
        let no_failures = !state
            .get("stage_failure")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        checks.push(("no stage failures".to_string(), no_failures));

        let failed: Vec<String> = checks
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name.clone())
            .collect();
        let verified = failed.is_empty();

        let mut output = json_map([
            ("query", json!(query)),
            ("system_verified", json!(verified)),
            (
                "verification_checks",
                json!(checks
                    .iter()
                    .map(|(name, ok)| json!({"check": name, "passed": ok}))
                    .collect::<Vec<_>>()),
            ),
        ]);
        if !verified {
            output.insert(
                "verification_decision".to_string(),
                json!({
                    "verified": false,
                    "reason": format!("failed checks: {}", failed.join(", ")),
                }),
            );
        }

        state.insert("verification".to_string(), json!({"verified": verified}));

        let confidence = if verified { 0.9996 } else { 0.4 };
        let escalate = self.profile.should_escalate(confidence, None);
        Ok(StageResult::new(output, confidence)
            .escalate(escalate)
            .with_trace(json_map([("entropy", json!(0.02))])))
    }
}
