//! Built-in compliance rules.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use thiserror::Error;

use crate::compliance::{ComplianceViolation, Severity, ViolationKind};
use crate::utils::json_ext::{nested_flag, nested_str};
use crate::utils::JsonMap;

/// A rule evaluation that could not complete.
///
/// A failing rule never aborts the check pipeline; the engine logs it and
/// treats the rule as having found no violation.
#[derive(Debug, Error, Diagnostic)]
#[error("compliance rule '{rule}' failed: {message}")]
#[diagnostic(code(echelon::compliance::rule_failed))]
pub struct RuleError {
    pub rule: String,
    pub message: String,
}

/// A single compliance check applied to every stage output.
pub trait ComplianceRule: Send + Sync {
    /// Stable identifier used by `remove_rule`.
    fn rule_id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Inspect one stage output. `Ok(None)` means no violation.
    fn check(
        &self,
        stage: u8,
        details: &JsonMap,
        confidence: Option<f64>,
        persona: Option<&str>,
    ) -> Result<Option<ComplianceViolation>, RuleError>;
}

/// Per-stage minimum confidence floors.
///
/// The default floor is 0.995; stages 5+ require 0.998, stages 8+ require
/// 0.999, and stage 10 requires perfect confidence. Stage-specific
/// overrides tighten (never loosen) those floors.
pub struct ConfidenceThresholdRule {
    min_confidence: f64,
    stage_overrides: FxHashMap<u8, f64>,
}

impl Default for ConfidenceThresholdRule {
    fn default() -> Self {
        let mut stage_overrides = FxHashMap::default();
        stage_overrides.insert(5, 0.998);
        stage_overrides.insert(8, 0.999);
        stage_overrides.insert(9, 0.9995);
        stage_overrides.insert(10, 1.0);
        Self {
            min_confidence: 0.995,
            stage_overrides,
        }
    }
}

impl ConfidenceThresholdRule {
    pub fn new(min_confidence: f64, stage_overrides: FxHashMap<u8, f64>) -> Self {
        Self {
            min_confidence,
            stage_overrides,
        }
    }

    fn threshold_for(&self, stage: u8) -> f64 {
        let mut threshold = self
            .stage_overrides
            .get(&stage)
            .copied()
            .unwrap_or(self.min_confidence);
        if stage == 10 {
            threshold = threshold.max(1.0);
        } else if stage >= 8 {
            threshold = threshold.max(0.999);
        } else if stage >= 5 {
            threshold = threshold.max(0.998);
        }
        threshold
    }
}

impl ComplianceRule for ConfidenceThresholdRule {
    fn rule_id(&self) -> &str {
        "confidence_threshold"
    }

    fn name(&self) -> &str {
        "Confidence Threshold Rule"
    }

    fn check(
        &self,
        stage: u8,
        _details: &JsonMap,
        confidence: Option<f64>,
        _persona: Option<&str>,
    ) -> Result<Option<ComplianceViolation>, RuleError> {
        let Some(confidence) = confidence else {
            return Ok(None);
        };
        let threshold = self.threshold_for(stage);
        if confidence < threshold {
            // High, not critical: an escalating pipeline legitimately
            // produces sub-threshold stages on its way up, and only
            // genuinely critical findings may feed the containment
            // accumulator.
            return Ok(Some(ComplianceViolation::new(
                ViolationKind::ConfidenceBelowThreshold,
                Severity::High,
                format!("confidence {confidence:.4} below required threshold {threshold:.4}"),
                stage,
                crate::utils::json_map([
                    ("confidence", json!(confidence)),
                    ("threshold", json!(threshold)),
                    ("shortfall", json!(threshold - confidence)),
                ]),
            )));
        }
        Ok(None)
    }
}

/// Scans stage details for the closed set of AGI-safety indicator flags.
#[derive(Default)]
pub struct AgiSafetyRule;

const SAFETY_INDICATORS: [&str; 6] = [
    "self_modification_detected",
    "recursive_improvement_detected",
    "goal_divergence_detected",
    "emergence_indicators_present",
    "paradigm_shift_detected",
    "quantum_decoherence_detected",
];

const NESTED_INDICATORS: [(&str, &str); 3] = [
    ("emergence_analysis.emergence_detected", "emergence_detected"),
    (
        "meta_insights.paradigm_instability_detected",
        "paradigm_instability",
    ),
    ("quantum_answer.decoherence_detected", "quantum_decoherence"),
];

impl ComplianceRule for AgiSafetyRule {
    fn rule_id(&self) -> &str {
        "agi_safety"
    }

    fn name(&self) -> &str {
        "AGI Safety Rule"
    }

    fn check(
        &self,
        stage: u8,
        details: &JsonMap,
        _confidence: Option<f64>,
        _persona: Option<&str>,
    ) -> Result<Option<ComplianceViolation>, RuleError> {
        let mut detected: Vec<&str> = SAFETY_INDICATORS
            .iter()
            .copied()
            .filter(|flag| details.get(*flag).and_then(Value::as_bool).unwrap_or(false))
            .collect();
        for (path, label) in NESTED_INDICATORS {
            if nested_flag(details, path) {
                detected.push(label);
            }
        }
        if detected.is_empty() {
            return Ok(None);
        }
        Ok(Some(ComplianceViolation::new(
            ViolationKind::AgiSafetyViolation,
            Severity::Critical,
            format!("AGI safety indicators detected: {}", detected.join(", ")),
            stage,
            crate::utils::json_map([
                ("indicators", json!(detected)),
                ("indicator_count", json!(detected.len())),
            ]),
        )))
    }
}

/// Flags denied ethical approval and critical ethical risk levels.
#[derive(Default)]
pub struct EthicalComplianceRule;

impl ComplianceRule for EthicalComplianceRule {
    fn rule_id(&self) -> &str {
        "ethical_compliance"
    }

    fn name(&self) -> &str {
        "Ethical Compliance Rule"
    }

    fn check(
        &self,
        stage: u8,
        details: &JsonMap,
        _confidence: Option<f64>,
        _persona: Option<&str>,
    ) -> Result<Option<ComplianceViolation>, RuleError> {
        if details.get("ethically_approved") == Some(&Value::Bool(false)) {
            let reason = nested_str(details, "ethical_decision.reason").unwrap_or("unknown reason");
            return Ok(Some(ComplianceViolation::new(
                ViolationKind::EthicalApprovalDenied,
                Severity::Critical,
                format!("ethical approval denied: {reason}"),
                stage,
                crate::utils::json_map([
                    (
                        "ethical_decision",
                        details.get("ethical_decision").cloned().unwrap_or(Value::Null),
                    ),
                    (
                        "ethical_risks",
                        details.get("ethical_risks").cloned().unwrap_or(Value::Null),
                    ),
                ]),
            )));
        }
        if nested_str(details, "ethical_risks.risk_level") == Some("critical") {
            return Ok(Some(ComplianceViolation::new(
                ViolationKind::CriticalEthicalRisk,
                Severity::Critical,
                "critical ethical risks identified".to_string(),
                stage,
                crate::utils::json_map([(
                    "ethical_risks",
                    details.get("ethical_risks").cloned().unwrap_or(Value::Null),
                )]),
            )));
        }
        Ok(None)
    }
}

/// Bounds per-stage memory churn: patches, forks, and corruption flags.
pub struct MemoryIntegrityRule {
    max_patches_per_stage: usize,
    max_forks_per_stage: usize,
}

impl Default for MemoryIntegrityRule {
    fn default() -> Self {
        Self {
            max_patches_per_stage: 10,
            max_forks_per_stage: 5,
        }
    }
}

impl ComplianceRule for MemoryIntegrityRule {
    fn rule_id(&self) -> &str {
        "memory_integrity"
    }

    fn name(&self) -> &str {
        "Memory Integrity Rule"
    }

    fn check(
        &self,
        stage: u8,
        details: &JsonMap,
        _confidence: Option<f64>,
        _persona: Option<&str>,
    ) -> Result<Option<ComplianceViolation>, RuleError> {
        let patches = match details.get("patches_applied") {
            Some(Value::Array(items)) => items.len(),
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
            _ => 0,
        };
        let forks = details
            .get("forks")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let corrupted = details
            .get("memory_corruption_detected")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut findings = Vec::new();
        if patches > self.max_patches_per_stage {
            findings.push(format!(
                "excessive patches: {patches} > {}",
                self.max_patches_per_stage
            ));
        }
        if forks > self.max_forks_per_stage {
            findings.push(format!(
                "excessive forks: {forks} > {}",
                self.max_forks_per_stage
            ));
        }
        if corrupted {
            findings.push("memory corruption detected".to_string());
        }
        if findings.is_empty() {
            return Ok(None);
        }
        Ok(Some(ComplianceViolation::new(
            ViolationKind::MemoryIntegrityViolation,
            Severity::High,
            findings.join("; "),
            stage,
            crate::utils::json_map([
                ("patches", json!(patches)),
                ("forks", json!(forks)),
                ("findings", json!(findings)),
            ]),
        )))
    }
}

/// Stage 9 must report successful system verification.
#[derive(Default)]
pub struct SystemVerificationRule;

impl ComplianceRule for SystemVerificationRule {
    fn rule_id(&self) -> &str {
        "system_verification"
    }

    fn name(&self) -> &str {
        "System Verification Rule"
    }

    fn check(
        &self,
        stage: u8,
        details: &JsonMap,
        _confidence: Option<f64>,
        _persona: Option<&str>,
    ) -> Result<Option<ComplianceViolation>, RuleError> {
        if stage != 9 {
            return Ok(None);
        }
        if details.get("system_verified") == Some(&Value::Bool(false)) {
            let reason =
                nested_str(details, "verification_decision.reason").unwrap_or("unknown reason");
            return Ok(Some(ComplianceViolation::new(
                ViolationKind::SystemVerificationFailed,
                Severity::Critical,
                format!("system verification failed: {reason}"),
                stage,
                crate::utils::json_map([(
                    "verification_decision",
                    details
                        .get("verification_decision")
                        .cloned()
                        .unwrap_or(Value::Null),
                )]),
            )));
        }
        Ok(None)
    }
}
