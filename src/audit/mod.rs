//! Append-only, hash-stamped audit trail for simulation runs.
//!
//! Every consequential event in the pipeline — stage passes, memory
//! patches, forks, agent decisions, escalations, compliance violations,
//! containment — lands here as an [`AuditEntry`] whose hash is computed
//! over a canonical JSON rendering of its content fields. An optional
//! hash chain threads each entry's hash through its successor.

mod certificate;

pub use certificate::ContainmentCertificate;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::utils::canonical::canonical_hash;
use crate::utils::JsonMap;

/// Closed vocabulary of audit event types.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SimulationStart,
    SimulationEnd,
    SimulationPass,
    MemoryPatch,
    Fork,
    AgentDecision,
    Escalation,
    ContainmentTrigger,
    ComplianceViolation,
    Cert,
    AiInteraction,
    AiStreamComplete,
    KaExecutionStart,
    KaExecutionSuccess,
    KaExecutionFailure,
    ContainmentReset,
}

impl AuditEventType {
    /// Wire name, e.g. `containment_trigger`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimulationStart => "simulation_start",
            Self::SimulationEnd => "simulation_end",
            Self::SimulationPass => "simulation_pass",
            Self::MemoryPatch => "memory_patch",
            Self::Fork => "fork",
            Self::AgentDecision => "agent_decision",
            Self::Escalation => "escalation",
            Self::ContainmentTrigger => "containment_trigger",
            Self::ComplianceViolation => "compliance_violation",
            Self::Cert => "cert",
            Self::AiInteraction => "ai_interaction",
            Self::AiStreamComplete => "ai_stream_complete",
            Self::KaExecutionStart => "ka_execution_start",
            Self::KaExecutionSuccess => "ka_execution_success",
            Self::KaExecutionFailure => "ka_execution_failure",
            Self::ContainmentReset => "containment_reset",
        }
    }
}

/// A single audit record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub entry_hash: String,
    /// Previous entry's hash when the log runs with chaining enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub event_type: AuditEventType,
    pub stage: Option<u8>,
    pub simulation_id: Option<String>,
    pub persona: Option<String>,
    pub confidence: Option<f64>,
    pub forked_from: Option<String>,
    pub certificate: Option<ContainmentCertificate>,
    pub details: JsonMap,
}

impl AuditEntry {
    /// Canonical content payload covered by `entry_hash`.
    fn hash_payload(&self) -> Value {
        let mut payload = json!({
            "timestamp": self.timestamp,
            "event_type": self.event_type.as_str(),
            "stage": self.stage,
            "simulation_id": self.simulation_id,
            "persona": self.persona,
            "details": Value::Object(self.details.clone()),
            "forked_from": self.forked_from,
        });
        if let Some(prev) = &self.prev_hash {
            payload["prev_hash"] = Value::String(prev.clone());
        }
        payload
    }

    /// Recompute the content hash and compare with the recorded one.
    pub fn verify(&self) -> bool {
        canonical_hash(&self.hash_payload()) == self.entry_hash
    }
}

/// Filter for [`AuditLog::query`]. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub stage: Option<u8>,
    pub simulation_id: Option<String>,
    pub persona: Option<String>,
    pub after_ts: Option<f64>,
    pub before_ts: Option<f64>,
}

impl AuditFilter {
    pub fn simulation(id: impl Into<String>) -> Self {
        Self {
            simulation_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn event(event_type: AuditEventType) -> Self {
        Self {
            event_type: Some(event_type),
            ..Default::default()
        }
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(et) = self.event_type {
            if entry.event_type != et {
                return false;
            }
        }
        if let Some(stage) = self.stage {
            if entry.stage != Some(stage) {
                return false;
            }
        }
        if let Some(sim) = &self.simulation_id {
            if entry.simulation_id.as_deref() != Some(sim.as_str()) {
                return false;
            }
        }
        if let Some(persona) = &self.persona {
            if entry.persona.as_deref() != Some(persona.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.after_ts {
            if entry.timestamp < after {
                return false;
            }
        }
        if let Some(before) = self.before_ts {
            if entry.timestamp >= before {
                return false;
            }
        }
        true
    }
}

/// An atomic snapshot of matching audit entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditBundle {
    pub bundle_id: Uuid,
    pub generated_at: f64,
    pub simulation_id: Option<String>,
    pub since_ts: f64,
    pub count: usize,
    pub entries: Vec<AuditEntry>,
}

/// Behavior switches for the log.
#[derive(Clone, Debug, Default)]
pub struct AuditConfig {
    /// Thread each entry's hash input through the previous entry's hash.
    pub hash_chain: bool,
}

struct LogInner {
    entries: Vec<AuditEntry>,
    by_id: FxHashMap<Uuid, usize>,
    last_hash: Option<String>,
}

/// Central, concurrency-safe audit trail.
///
/// Appends take a single lock; queries copy a consistent snapshot under
/// the same lock, so readers always observe a prefix of the log.
pub struct AuditLog {
    config: AuditConfig,
    inner: Mutex<LogInner>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(AuditConfig::default())
    }
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(LogInner {
                entries: Vec::new(),
                by_id: FxHashMap::default(),
                last_hash: None,
            }),
        }
    }

    /// Start a draft entry. Finish it with [`AuditDraft::append`].
    ///
    /// ```
    /// use echelon::audit::{AuditEventType, AuditLog};
    /// use serde_json::json;
    ///
    /// let log = AuditLog::default();
    /// let entry = log
    ///     .entry(AuditEventType::MemoryPatch, Default::default())
    ///     .stage(2)
    ///     .simulation_id("sim-1")
    ///     .append();
    /// assert!(entry.verify());
    /// ```
    pub fn entry(&self, event_type: AuditEventType, details: JsonMap) -> AuditDraft<'_> {
        AuditDraft {
            log: self,
            event_type,
            details,
            stage: None,
            simulation_id: None,
            persona: None,
            confidence: None,
            forked_from: None,
            certificate: None,
        }
    }

    fn append(&self, draft: AuditDraft<'_>) -> AuditEntry {
        let mut inner = self.inner.lock();
        let prev_hash = if self.config.hash_chain {
            inner.last_hash.clone()
        } else {
            None
        };
        let mut entry = AuditEntry {
            entry_id: Uuid::new_v4(),
            entry_hash: String::new(),
            prev_hash,
            timestamp: now_epoch_seconds(),
            event_type: draft.event_type,
            stage: draft.stage,
            simulation_id: draft.simulation_id,
            persona: draft.persona,
            confidence: draft.confidence,
            forked_from: draft.forked_from,
            certificate: draft.certificate,
            details: draft.details,
        };
        entry.entry_hash = canonical_hash(&entry.hash_payload());
        inner.last_hash = Some(entry.entry_hash.clone());
        let index = inner.entries.len();
        inner.by_id.insert(entry.entry_id, index);
        inner.entries.push(entry.clone());
        debug!(event = entry.event_type.as_str(), sim = ?entry.simulation_id, "audit entry appended");
        entry
    }

    /// Timestamp-ordered entries matching the filter.
    pub fn query(&self, filter: &AuditFilter, limit: usize, offset: usize) -> Vec<AuditEntry> {
        let inner = self.inner.lock();
        let mut matched: Vec<AuditEntry> = inner
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        drop(inner);
        // Insertion order already is timestamp order; the sort keeps the
        // contract explicit and stable.
        matched.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        matched.into_iter().skip(offset).take(limit).collect()
    }

    pub fn get_by_id(&self, entry_id: &Uuid) -> Option<AuditEntry> {
        let inner = self.inner.lock();
        inner
            .by_id
            .get(entry_id)
            .and_then(|&i| inner.entries.get(i))
            .cloned()
    }

    /// Atomic snapshot of entries for a simulation since a timestamp.
    pub fn snapshot_bundle(&self, simulation_id: Option<&str>, since_ts: f64) -> AuditBundle {
        let filter = AuditFilter {
            simulation_id: simulation_id.map(str::to_string),
            after_ts: Some(since_ts),
            ..Default::default()
        };
        let entries = self.query(&filter, usize::MAX, 0);
        AuditBundle {
            bundle_id: Uuid::new_v4(),
            generated_at: now_epoch_seconds(),
            simulation_id: simulation_id.map(str::to_string),
            since_ts,
            count: entries.len(),
            entries,
        }
    }

    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.by_id.clear();
        inner.last_hash = None;
    }

    /// Drop all entries belonging to one simulation.
    pub fn clear_simulation(&self, simulation_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|e| e.simulation_id.as_deref() != Some(simulation_id));
        let entries = std::mem::take(&mut inner.entries);
        inner.by_id = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.entry_id, i))
            .collect();
        inner.entries = entries;
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-progress audit entry; every optional field has a setter.
pub struct AuditDraft<'a> {
    log: &'a AuditLog,
    event_type: AuditEventType,
    details: JsonMap,
    stage: Option<u8>,
    simulation_id: Option<String>,
    persona: Option<String>,
    confidence: Option<f64>,
    forked_from: Option<String>,
    certificate: Option<ContainmentCertificate>,
}

impl AuditDraft<'_> {
    #[must_use]
    pub fn stage(mut self, stage: u8) -> Self {
        self.stage = Some(stage);
        self
    }

    #[must_use]
    pub fn simulation_id(mut self, id: impl Into<String>) -> Self {
        self.simulation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    #[must_use]
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    #[must_use]
    pub fn forked_from(mut self, cell_id: impl Into<String>) -> Self {
        self.forked_from = Some(cell_id.into());
        self
    }

    #[must_use]
    pub fn certificate(mut self, cert: ContainmentCertificate) -> Self {
        self.certificate = Some(cert);
        self
    }

    /// Commit the draft to the log.
    pub fn append(self) -> AuditEntry {
        let log = self.log;
        log.append(self)
    }
}

pub(crate) fn now_epoch_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}
