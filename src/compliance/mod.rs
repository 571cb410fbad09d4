//! Compliance monitoring and containment decisioning.
//!
//! The [`ComplianceEngine`] inspects every stage output against its rule
//! set, logs violations to the audit trail, and decides when the pipeline
//! must be contained. Containment mints a hash-stamped
//! [`ContainmentCertificate`](crate::audit::ContainmentCertificate) and
//! latches the engine; subsequent triggers are no-ops until an explicit,
//! audited reset.

pub mod rules;

pub use rules::{
    AgiSafetyRule, ComplianceRule, ConfidenceThresholdRule, EthicalComplianceRule,
    MemoryIntegrityRule, RuleError, SystemVerificationRule,
};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditLog, ContainmentCertificate};
use crate::utils::{json_map, JsonMap};

/// Violation severity levels.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Classified violation kinds. Custom rules may introduce their own.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    ConfidenceBelowThreshold,
    AgiSafetyViolation,
    EthicalApprovalDenied,
    CriticalEthicalRisk,
    MemoryIntegrityViolation,
    SystemVerificationFailed,
    Custom(String),
}

impl ViolationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConfidenceBelowThreshold => "confidence_below_threshold",
            Self::AgiSafetyViolation => "agi_safety_violation",
            Self::EthicalApprovalDenied => "ethical_approval_denied",
            Self::CriticalEthicalRisk => "critical_ethical_risk",
            Self::MemoryIntegrityViolation => "memory_integrity_violation",
            Self::SystemVerificationFailed => "system_verification_failed",
            Self::Custom(name) => name,
        }
    }

    /// Kinds whose critical occurrence triggers containment immediately.
    fn is_immediate_trigger(&self) -> bool {
        matches!(
            self,
            Self::AgiSafetyViolation | Self::EthicalApprovalDenied | Self::SystemVerificationFailed
        )
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for ViolationKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ViolationKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "confidence_below_threshold" => Self::ConfidenceBelowThreshold,
            "agi_safety_violation" => Self::AgiSafetyViolation,
            "ethical_approval_denied" => Self::EthicalApprovalDenied,
            "critical_ethical_risk" => Self::CriticalEthicalRisk,
            "memory_integrity_violation" => Self::MemoryIntegrityViolation,
            "system_verification_failed" => Self::SystemVerificationFailed,
            other => Self::Custom(other.to_string()),
        })
    }
}

/// A single compliance finding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplianceViolation {
    pub id: Uuid,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub description: String,
    pub stage: u8,
    pub details: JsonMap,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
}

impl ComplianceViolation {
    pub fn new(
        kind: ViolationKind,
        severity: Severity,
        description: String,
        stage: u8,
        details: JsonMap,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            description,
            stage,
            details,
            timestamp: Utc::now(),
            resolved: false,
        }
    }

    fn to_json(&self) -> JsonMap {
        json_map([
            ("id", json!(self.id.to_string())),
            ("violation_type", json!(self.kind.as_str())),
            ("severity", json!(self.severity.to_string())),
            ("description", json!(self.description)),
            ("stage", json!(self.stage)),
            ("details", Value::Object(self.details.clone())),
            ("timestamp", json!(self.timestamp.to_rfc3339())),
            ("resolved", json!(self.resolved)),
        ])
    }
}

/// Filter for [`ComplianceEngine::violations`].
#[derive(Clone, Debug, Default)]
pub struct ViolationFilter {
    pub severity: Option<Severity>,
    pub stage: Option<u8>,
    pub resolved: Option<bool>,
}

/// Overall compliance posture.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceState {
    Compliant,
    Warning,
    Critical,
    Contained,
}

/// Snapshot returned by [`ComplianceEngine::status`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplianceStatus {
    pub state: ComplianceState,
    pub containment_triggered: bool,
    pub total_violations: usize,
    pub unresolved_violations: usize,
    pub critical_violations: usize,
    pub active_rules: usize,
}

struct EngineInner {
    rules: Vec<Box<dyn ComplianceRule>>,
    violations: Vec<ComplianceViolation>,
    containment_triggered: bool,
}

/// Rule-driven compliance monitor with containment latch.
pub struct ComplianceEngine {
    audit: Arc<AuditLog>,
    /// Critical violations among the last ten logged beyond which
    /// accumulative containment fires.
    containment_threshold: usize,
    inner: Mutex<EngineInner>,
}

impl ComplianceEngine {
    /// Engine with the five default rules installed.
    pub fn new(audit: Arc<AuditLog>) -> Self {
        let rules: Vec<Box<dyn ComplianceRule>> = vec![
            Box::new(ConfidenceThresholdRule::default()),
            Box::new(AgiSafetyRule),
            Box::new(EthicalComplianceRule),
            Box::new(MemoryIntegrityRule::default()),
            Box::new(SystemVerificationRule),
        ];
        Self {
            audit,
            containment_threshold: 2,
            inner: Mutex::new(EngineInner {
                rules,
                violations: Vec::new(),
                containment_triggered: false,
            }),
        }
    }

    /// Engine with no rules; used by embedders composing their own set.
    pub fn empty(audit: Arc<AuditLog>) -> Self {
        Self {
            audit,
            containment_threshold: 2,
            inner: Mutex::new(EngineInner {
                rules: Vec::new(),
                violations: Vec::new(),
                containment_triggered: false,
            }),
        }
    }

    #[must_use]
    pub fn with_containment_threshold(mut self, threshold: usize) -> Self {
        self.containment_threshold = threshold;
        self
    }

    pub fn add_rule(&self, rule: Box<dyn ComplianceRule>) {
        self.inner.lock().rules.push(rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.rules.len();
        inner.rules.retain(|r| r.rule_id() != rule_id);
        inner.rules.len() != before
    }

    /// Evaluate every enabled rule against one stage output, log all
    /// violations, and decide containment.
    ///
    /// Returns the minted certificate when this check triggers
    /// containment; `None` otherwise (including when containment already
    /// latched).
    pub fn check_and_log(
        &self,
        stage: u8,
        details: &JsonMap,
        confidence: Option<f64>,
        persona: Option<&str>,
        simulation_id: Option<&str>,
    ) -> Option<ContainmentCertificate> {
        let mut inner = self.inner.lock();
        let mut fresh: Vec<ComplianceViolation> = Vec::new();

        for rule in &inner.rules {
            match rule.check(stage, details, confidence, persona) {
                Ok(Some(violation)) => {
                    warn!(
                        rule = rule.rule_id(),
                        kind = violation.kind.as_str(),
                        severity = %violation.severity,
                        stage,
                        "compliance violation"
                    );
                    let mut entry = self
                        .audit
                        .entry(AuditEventType::ComplianceViolation, violation.to_json())
                        .stage(stage);
                    if let Some(sim) = simulation_id {
                        entry = entry.simulation_id(sim);
                    }
                    if let Some(p) = persona {
                        entry = entry.persona(p);
                    }
                    if let Some(c) = confidence {
                        entry = entry.confidence(c);
                    }
                    entry.append();
                    fresh.push(violation);
                }
                Ok(None) => {}
                Err(err) => {
                    // Treated as no violation from this rule.
                    error!(rule = rule.rule_id(), %err, "compliance rule failed");
                }
            }
        }

        inner.violations.extend(fresh.iter().cloned());

        let immediate = fresh
            .iter()
            .any(|v| v.severity == Severity::Critical && v.kind.is_immediate_trigger());
        let recent_critical = inner
            .violations
            .iter()
            .rev()
            .take(10)
            .filter(|v| v.severity == Severity::Critical)
            .count();
        let accumulative = recent_critical > self.containment_threshold;

        if !(immediate || accumulative) {
            return None;
        }
        if inner.containment_triggered {
            return None;
        }
        inner.containment_triggered = true;

        let snapshot = json!({
            "trigger_stage": stage,
            "trigger_violations": fresh.iter().map(|v| Value::Object(v.to_json())).collect::<Vec<_>>(),
            "total_violations": inner.violations.len(),
            "recent_critical": recent_critical,
            "reason": if immediate {
                "critical violation with immediate containment semantics"
            } else {
                "critical violations exceeded containment threshold"
            },
        });
        drop(inner);

        let cert = ContainmentCertificate::mint(
            "containment",
            Some(stage),
            snapshot.clone(),
            simulation_id.map(str::to_string),
            persona.map(str::to_string),
        );

        error!(stage, cert_id = %cert.cert_id, "containment triggered");
        let mut entry = self
            .audit
            .entry(
                AuditEventType::ContainmentTrigger,
                snapshot.as_object().cloned().unwrap_or_default(),
            )
            .stage(stage)
            .confidence(0.0)
            .certificate(cert.clone());
        if let Some(sim) = simulation_id {
            entry = entry.simulation_id(sim);
        }
        if let Some(p) = persona {
            entry = entry.persona(p);
        }
        entry.append();

        Some(cert)
    }

    /// Violations matching the filter, oldest first.
    pub fn violations(&self, filter: &ViolationFilter) -> Vec<ComplianceViolation> {
        self.inner
            .lock()
            .violations
            .iter()
            .filter(|v| {
                filter.severity.is_none_or(|s| v.severity == s)
                    && filter.stage.is_none_or(|s| v.stage == s)
                    && filter.resolved.is_none_or(|r| v.resolved == r)
            })
            .cloned()
            .collect()
    }

    /// Mark a violation resolved, attaching the resolution note.
    pub fn resolve(&self, violation_id: &Uuid, note: &str) -> bool {
        let mut inner = self.inner.lock();
        for violation in &mut inner.violations {
            if violation.id == *violation_id {
                violation.resolved = true;
                violation
                    .details
                    .insert("resolution_note".to_string(), json!(note));
                violation
                    .details
                    .insert("resolved_at".to_string(), json!(Utc::now().to_rfc3339()));
                return true;
            }
        }
        false
    }

    pub fn status(&self) -> ComplianceStatus {
        let inner = self.inner.lock();
        let total = inner.violations.len();
        let unresolved = inner.violations.iter().filter(|v| !v.resolved).count();
        let critical = inner
            .violations
            .iter()
            .filter(|v| v.severity == Severity::Critical && !v.resolved)
            .count();
        let state = if inner.containment_triggered {
            ComplianceState::Contained
        } else if critical > 0 {
            ComplianceState::Critical
        } else if unresolved > 5 {
            ComplianceState::Warning
        } else {
            ComplianceState::Compliant
        };
        ComplianceStatus {
            state,
            containment_triggered: inner.containment_triggered,
            total_violations: total,
            unresolved_violations: unresolved,
            critical_violations: critical,
            active_rules: inner.rules.len(),
        }
    }

    pub fn containment_triggered(&self) -> bool {
        self.inner.lock().containment_triggered
    }

    /// Lift the containment latch. Audited; use with extreme caution.
    pub fn reset_containment(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if !inner.containment_triggered {
            return;
        }
        inner.containment_triggered = false;
        let total = inner.violations.len();
        drop(inner);
        warn!(reason, "containment reset");
        self.audit
            .entry(
                AuditEventType::ContainmentReset,
                json_map([
                    ("reason", json!(reason)),
                    ("previous_violations", json!(total)),
                ]),
            )
            .append();
    }

    /// Drop resolved violations older than the cutoff.
    pub fn clear_resolved(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut inner = self.inner.lock();
        let before = inner.violations.len();
        inner
            .violations
            .retain(|v| !v.resolved || v.timestamp > cutoff);
        before - inner.violations.len()
    }
}
