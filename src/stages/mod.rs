//! Stage contract and registry.
//!
//! A stage is one of the ten numbered processing steps of the pipeline.
//! Stages are pure with respect to their inputs: side effects flow only
//! through the shared services exposed on [`StageContext`] (memory,
//! agents, plugins, audit), and the committed record of each execution is
//! the [`StageResult`] the executor folds into the session. A stage never
//! mutates the session itself.

mod containment;
mod context;
mod entry;
mod ethics;
mod gatekeeper;
mod parallel;
mod perspective;
mod recall;
mod research;
mod synthesis;
mod verification;

pub use containment::ContainmentStage;
pub use context::StageContext;
pub use entry::EntryStage;
pub use ethics::EthicsStage;
pub use gatekeeper::GatekeeperStage;
pub use parallel::ParallelHypothesisStage;
pub use perspective::PerspectiveStage;
pub use recall::RecallStage;
pub use research::ResearchStage;
pub use synthesis::SynthesisStage;
pub use verification::VerificationStage;

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::agents::AgentError;
use crate::utils::{json_map, JsonMap};

/// Errors a stage may fail with. The executor recovers every stage error
/// into a synthesized low-confidence result; these never unwind further.
#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    /// Expected input data missing from the working payload.
    #[error("missing expected input: {what}")]
    #[diagnostic(code(echelon::stages::missing_input))]
    MissingInput { what: &'static str },

    /// Agent subsystem failure the stage could not absorb.
    #[error(transparent)]
    #[diagnostic(code(echelon::stages::agents))]
    Agents(#[from] AgentError),

    /// Anything else the stage considers fatal for this pass.
    #[error("stage failed: {message}")]
    #[diagnostic(code(echelon::stages::internal))]
    Internal { message: String },
}

/// Static description of a stage: identity, thresholds, requirements.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageProfile {
    pub number: u8,
    pub name: String,
    pub confidence_threshold: f64,
    pub entropy_threshold: f64,
    pub max_processing_ms: u64,
    pub requires_agents: bool,
    pub requires_memory: bool,
    pub safety_critical: bool,
}

impl StageProfile {
    pub fn new(number: u8, name: impl Into<String>) -> Self {
        Self {
            number,
            name: name.into(),
            confidence_threshold: 0.85,
            entropy_threshold: 0.1,
            max_processing_ms: 30_000,
            requires_agents: false,
            requires_memory: true,
            safety_critical: false,
        }
    }

    #[must_use]
    pub fn confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    #[must_use]
    pub fn entropy_threshold(mut self, threshold: f64) -> Self {
        self.entropy_threshold = threshold;
        self
    }

    #[must_use]
    pub fn requires_agents(mut self) -> Self {
        self.requires_agents = true;
        self
    }

    #[must_use]
    pub fn safety_critical(mut self) -> Self {
        self.safety_critical = true;
        self
    }

    /// Escalation decision for a confidence/entropy pair produced under
    /// this profile.
    pub fn should_escalate(&self, confidence: f64, entropy: Option<f64>) -> bool {
        confidence < self.confidence_threshold
            || entropy.is_some_and(|e| e > self.entropy_threshold)
    }
}

/// The committed outcome of one stage execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageResult {
    pub output: JsonMap,
    pub confidence: f64,
    pub escalate: bool,
    pub trace: JsonMap,
    pub patches: Vec<Value>,
    pub forks: Vec<Value>,
    pub agents_spawned: Vec<String>,
    pub metadata: JsonMap,
    pub processing_time_ms: u64,
}

impl StageResult {
    pub fn new(output: JsonMap, confidence: f64) -> Self {
        Self {
            output,
            confidence: confidence.clamp(0.0, 1.0),
            escalate: false,
            trace: JsonMap::new(),
            patches: Vec::new(),
            forks: Vec::new(),
            agents_spawned: Vec::new(),
            metadata: JsonMap::new(),
            processing_time_ms: 0,
        }
    }

    /// The synthesized result the executor commits when a stage fails.
    ///
    /// Confidence bottoms out at 0.1 and escalation is forced so the
    /// pipeline keeps moving instead of aborting.
    pub fn failure(input: &JsonMap, stage_number: u8, error: &str) -> Self {
        Self {
            output: input.clone(),
            confidence: 0.1,
            escalate: true,
            trace: json_map([
                ("error", json!(error)),
                ("stage", json!(stage_number)),
            ]),
            patches: Vec::new(),
            forks: Vec::new(),
            agents_spawned: Vec::new(),
            metadata: json_map([("failed", json!(true))]),
            processing_time_ms: 0,
        }
    }

    #[must_use]
    pub fn escalate(mut self, escalate: bool) -> Self {
        self.escalate = escalate;
        self
    }

    #[must_use]
    pub fn with_trace(mut self, trace: JsonMap) -> Self {
        self.trace = trace;
        self
    }

    #[must_use]
    pub fn with_patches(mut self, patches: Vec<Value>) -> Self {
        self.patches = patches;
        self
    }

    #[must_use]
    pub fn with_forks(mut self, forks: Vec<Value>) -> Self {
        self.forks = forks;
        self
    }

    #[must_use]
    pub fn with_agents_spawned(mut self, agents: Vec<String>) -> Self {
        self.agents_spawned = agents;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Entropy reported in the trace, if the stage recorded one.
    pub fn entropy(&self) -> Option<f64> {
        self.trace.get("entropy").and_then(Value::as_f64)
    }
}

/// The working query, wherever the previous stage left it.
pub(crate) fn query_of(input: &JsonMap) -> &str {
    input
        .get("query")
        .or_else(|| input.get("user_query"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// Agents a stage needs the executor to spawn before it runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentRequisition {
    Research {
        count: usize,
        specializations: Option<Vec<String>>,
    },
    Perspective {
        stakeholders: Vec<String>,
    },
}

/// One of the ten processing steps.
#[async_trait]
pub trait Stage: Send + Sync {
    fn profile(&self) -> &StageProfile;

    /// Agents to attach before `process` runs. Only consulted when the
    /// profile declares `requires_agents`.
    fn agent_requisition(&self) -> Option<AgentRequisition> {
        None
    }

    /// Execute the stage over the working input.
    ///
    /// `state` is the session-scoped accumulator threaded between
    /// stages; mutations to it are visible to later stages but are not
    /// part of the committed output.
    async fn process(
        &self,
        input: &JsonMap,
        state: &mut JsonMap,
        ctx: &StageContext,
    ) -> Result<StageResult, StageError>;
}

/// Stage-number-keyed registry. New stages register at startup; the
/// executor resolves by number on every pass.
pub struct StageRegistry {
    stages: FxHashMap<u8, Arc<dyn Stage>>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            stages: FxHashMap::default(),
        }
    }

    /// Registry holding the ten built-in stages.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(EntryStage::new()));
        registry.register(Arc::new(RecallStage::new()));
        registry.register(Arc::new(ResearchStage::new()));
        registry.register(Arc::new(PerspectiveStage::new()));
        registry.register(Arc::new(GatekeeperStage::new()));
        registry.register(Arc::new(SynthesisStage::new()));
        registry.register(Arc::new(ParallelHypothesisStage::new()));
        registry.register(Arc::new(EthicsStage::new()));
        registry.register(Arc::new(VerificationStage::new()));
        registry.register(Arc::new(ContainmentStage::new()));
        registry
    }

    /// Register a stage under its profile number, replacing any previous
    /// occupant.
    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.profile().number, stage);
    }

    pub fn get(&self, number: u8) -> Option<Arc<dyn Stage>> {
        self.stages.get(&number).cloned()
    }

    /// Registered stages in number order.
    pub fn all(&self) -> Vec<Arc<dyn Stage>> {
        let mut stages: Vec<Arc<dyn Stage>> = self.stages.values().cloned().collect();
        stages.sort_by_key(|s| s.profile().number);
        stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::agents::AgentManager;
    use crate::audit::AuditLog;
    use crate::coordinate::Coordinate;
    use crate::memory::MemoryGraph;
    use crate::plugins::dispatch::KaDispatchTable;
    use crate::plugins::PluginRegistry;

    /// Fresh context over isolated service instances.
    pub(crate) fn context() -> StageContext {
        let audit = Arc::new(AuditLog::default());
        StageContext {
            memory: Arc::new(MemoryGraph::new()),
            agents: Arc::new(AgentManager::new()),
            plugins: Arc::new(PluginRegistry::with_builtins(Arc::clone(&audit))),
            dispatch: Arc::new(KaDispatchTable::with_defaults()),
            audit,
            session_id: "test-session".to_string(),
            run_id: "run-test".to_string(),
            coordinate: Coordinate::builder("PL09").sector("5415").build().unwrap(),
            attached_agents: Vec::new(),
        }
    }

    pub(crate) fn input_for(query: &str) -> JsonMap {
        json_map([("query", json!(query))])
    }
}
