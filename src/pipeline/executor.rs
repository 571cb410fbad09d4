//! Drives a session through the stage sequence.
//!
//! The executor owns no state of its own beyond the shared service
//! handles: it threads the working payload between stages, commits a
//! [`StageState`] per pass, audits and broadcasts every lifecycle event,
//! runs the compliance engine on every stage output, and applies the
//! escalation/completion policy.

use std::sync::Arc;
use std::time::Instant;

use miette::Diagnostic;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::agents::AgentManager;
use crate::audit::{now_epoch_seconds, AuditEventType, AuditLog, ContainmentCertificate};
use crate::compliance::ComplianceEngine;
use crate::coordinate::Coordinate;
use crate::hub::{MessageType, SessionDirectory, SessionHub};
use crate::memory::MemoryGraph;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::session::{
    ConfidenceScore, Session, SessionStatus, SimulationQuery, StageState, StageStatus,
    TraceEventKind, TraceStep,
};
use crate::pipeline::store::SessionStore;
use crate::plugins::dispatch::KaDispatchTable;
use crate::plugins::PluginRegistry;
use crate::stages::{AgentRequisition, StageContext, StageRegistry, StageResult};
use crate::utils::{json_map, JsonMap};

/// Errors surfaced by the pipeline control surface.
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("session not found: {session_id}")]
    #[diagnostic(code(echelon::pipeline::session_not_found))]
    SessionNotFound { session_id: String },

    #[error("session {session_id} is terminal ({status:?}) and cannot be driven")]
    #[diagnostic(code(echelon::pipeline::session_terminal))]
    SessionTerminal {
        session_id: String,
        status: SessionStatus,
    },

    #[error("session {session_id} is not paused")]
    #[diagnostic(code(echelon::pipeline::not_paused))]
    SessionNotPaused { session_id: String },

    #[error("cannot step backward from stage {from} to stage {to}")]
    #[diagnostic(code(echelon::pipeline::backward_step))]
    BackwardStep { from: u8, to: u8 },

    #[error("cannot step past the final stage (requested {stage})")]
    #[diagnostic(code(echelon::pipeline::past_final_stage))]
    PastFinalStage { stage: u8 },

    #[error("pipeline internal error: {message}")]
    #[diagnostic(code(echelon::pipeline::internal))]
    Internal { message: String },
}

/// Everything a completed run hands back to the caller.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub session: Session,
    pub trace: Vec<TraceStep>,
    pub final_output: Option<JsonMap>,
    pub state: JsonMap,
}

struct StageCommit {
    result: StageResult,
    certificate: Option<ContainmentCertificate>,
}

/// Sequences stages, commits their results, and applies the
/// escalation/completion/containment policy.
pub struct PipelineExecutor {
    config: PipelineConfig,
    memory: Arc<MemoryGraph>,
    agents: Arc<AgentManager>,
    plugins: Arc<PluginRegistry>,
    dispatch: Arc<KaDispatchTable>,
    audit: Arc<AuditLog>,
    compliance: Arc<ComplianceEngine>,
    store: Arc<SessionStore>,
    hub: Arc<SessionHub>,
    stages: Arc<StageRegistry>,
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl PipelineExecutor {
    /// Executor over freshly wired process-wide services: one memory
    /// graph, one audit log, one compliance engine, one plugin registry,
    /// one hub, one session store.
    pub fn new(config: PipelineConfig) -> Self {
        let audit = Arc::new(AuditLog::default());
        let store = Arc::new(SessionStore::new());
        let hub = Arc::new(SessionHub::new(
            Arc::clone(&store) as Arc<dyn SessionDirectory>
        ));
        Self {
            memory: Arc::new(MemoryGraph::new()),
            agents: Arc::new(AgentManager::new()),
            plugins: Arc::new(PluginRegistry::with_builtins(Arc::clone(&audit))),
            dispatch: Arc::new(KaDispatchTable::with_defaults()),
            compliance: Arc::new(ComplianceEngine::new(Arc::clone(&audit))),
            stages: Arc::new(StageRegistry::with_defaults()),
            audit,
            store,
            hub,
            config,
        }
    }

    /// Swap in a custom stage registry (stub stages, reduced ladders).
    #[must_use]
    pub fn with_stage_registry(mut self, registry: StageRegistry) -> Self {
        self.stages = Arc::new(registry);
        self
    }

    #[must_use]
    pub fn with_dispatch_table(mut self, dispatch: KaDispatchTable) -> Self {
        self.dispatch = Arc::new(dispatch);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn memory(&self) -> &Arc<MemoryGraph> {
        &self.memory
    }

    pub fn agents(&self) -> &Arc<AgentManager> {
        &self.agents
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn compliance(&self) -> &Arc<ComplianceEngine> {
        &self.compliance
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    /// Run a query through the pipeline until completion, containment,
    /// failure, or stage exhaustion.
    #[instrument(skip(self, query), err)]
    pub async fn run(
        &self,
        query: SimulationQuery,
        user_id: Option<&str>,
        max_stages: Option<u8>,
    ) -> Result<RunOutcome, PipelineError> {
        let session = self.store.create(query, user_id);
        let session_id = session.id.clone();
        info!(session = %session_id, run = %session.run_id, "starting simulation");

        self.prepare(&session_id).await?;
        let limit = max_stages
            .unwrap_or(self.config.max_stages)
            .min(self.config.max_stages);
        self.drive(&session_id, 1, limit).await?;
        self.finish(&session_id).await
    }

    /// Resume a paused session from its next stage.
    #[instrument(skip(self), err)]
    pub async fn resume(&self, session_id: &str) -> Result<RunOutcome, PipelineError> {
        let mut session = self.load(session_id)?;
        if session.status != SessionStatus::Paused {
            return Err(PipelineError::SessionNotPaused {
                session_id: session_id.to_string(),
            });
        }
        session.status = SessionStatus::Running;
        let from = session.current_stage + 1;
        self.store.update(session);
        self.drive(session_id, from, self.config.max_stages).await?;
        self.finish(session_id).await
    }

    /// Advance a READY or PAUSED session by one stage.
    ///
    /// Same commit rules as the driving loop: unregistered stage
    /// numbers are skipped with a warning, so the step lands on the
    /// next registered stage. The session is left PAUSED unless the
    /// stage completed or contained the run.
    #[instrument(skip(self), err)]
    pub async fn step(&self, session_id: &str) -> Result<StageResult, PipelineError> {
        let session = self.load(session_id)?;
        if session.is_terminal() {
            return Err(PipelineError::SessionTerminal {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }
        let target = session.current_stage + 1;
        if target > self.config.max_stages {
            return Err(PipelineError::PastFinalStage { stage: target });
        }
        if session.status == SessionStatus::Ready {
            self.prepare(session_id).await?;
        }

        let mut session = self.load(session_id)?;
        session.status = SessionStatus::Running;
        self.store.update(session.clone());

        let input = Self::working_input(&session);
        let prev = session.last_stage().map_or(0.0, |s| s.confidence.score);
        let mut commit = None;
        for stage_number in target..=self.config.max_stages {
            if let Some(done) = self
                .execute_stage(&mut session, stage_number, &input, prev)
                .await?
            {
                commit = Some(done);
                break;
            }
        }

        let mut session = self.load(session_id)?;
        let Some(commit) = commit else {
            // Only unregistered numbers remained ahead of the cursor.
            session.status = SessionStatus::Paused;
            self.store.update(session);
            return Err(PipelineError::PastFinalStage {
                stage: self.config.max_stages + 1,
            });
        };

        // Park the session again unless the stage ended the run.
        if !session.is_terminal() {
            session.status = SessionStatus::Paused;
            self.store.update(session);
        } else {
            let _ = self.finish(session_id).await?;
        }
        Ok(commit.result)
    }

    /// Step a session forward to `target`, one stage at a time.
    pub async fn step_to(
        &self,
        session_id: &str,
        target: u8,
    ) -> Result<Vec<StageResult>, PipelineError> {
        let session = self.load(session_id)?;
        if target <= session.current_stage {
            return Err(PipelineError::BackwardStep {
                from: session.current_stage,
                to: target,
            });
        }
        if target > self.config.max_stages {
            return Err(PipelineError::PastFinalStage { stage: target });
        }
        let mut results = Vec::new();
        while self.load(session_id)?.current_stage < target {
            results.push(self.step(session_id).await?);
            if self.load(session_id)?.is_terminal() {
                break;
            }
        }
        Ok(results)
    }

    /// Pause a running session; the executor notices at the next stage
    /// boundary.
    pub async fn pause(&self, session_id: &str) -> Result<(), PipelineError> {
        let mut session = self.load(session_id)?;
        if session.is_terminal() {
            return Err(PipelineError::SessionTerminal {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }
        session.status = SessionStatus::Paused;
        self.store.update(session);
        info!(session = session_id, "session paused");
        Ok(())
    }

    /// Force containment on a session.
    pub async fn contain(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<ContainmentCertificate, PipelineError> {
        let mut session = self.load(session_id)?;
        if session.is_terminal() {
            return Err(PipelineError::SessionTerminal {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }
        let cert = ContainmentCertificate::mint(
            "manual_containment",
            Some(session.current_stage),
            json!({"reason": reason}),
            Some(session_id.to_string()),
            None,
        );
        self.audit
            .entry(
                AuditEventType::ContainmentTrigger,
                json_map([("reason", json!(reason)), ("manual", json!(true))]),
            )
            .simulation_id(session_id)
            .certificate(cert.clone())
            .append();
        session.status = SessionStatus::Contained;
        self.store.update(session);
        self.hub
            .broadcast_session(
                session_id,
                MessageType::ContainmentTriggered,
                json_map([
                    ("cert_id", json!(cert.cert_id.to_string())),
                    ("cert_hash", json!(cert.cert_hash)),
                    ("reason", json!(reason)),
                ]),
                None,
            )
            .await;
        warn!(session = session_id, reason, "manual containment");
        Ok(cert)
    }

    fn load(&self, session_id: &str) -> Result<Session, PipelineError> {
        self.store
            .get(session_id)
            .ok_or_else(|| PipelineError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Mark the session RUNNING, seed its state accumulator, and emit
    /// the start events.
    async fn prepare(&self, session_id: &str) -> Result<(), PipelineError> {
        let mut session = self.load(session_id)?;
        session.status = SessionStatus::Running;
        session.state.insert("start_time".to_string(), json!(now_epoch_seconds()));
        session
            .state
            .insert("session_id".to_string(), json!(session.id));
        session.state.insert("run_id".to_string(), json!(session.run_id));
        session
            .state
            .insert("orig_query".to_string(), json!(session.query.query));
        session.state.insert(
            "coordinate".to_string(),
            json!(Self::coordinate_of(&session).encode()),
        );
        self.store.update(session.clone());

        self.audit
            .entry(
                AuditEventType::SimulationStart,
                json_map([
                    ("query", json!(session.query.query)),
                    ("user_id", json!(session.user_id)),
                ]),
            )
            .simulation_id(session_id)
            .append();
        self.hub
            .broadcast_session(
                session_id,
                MessageType::SimulationStarted,
                json_map([
                    ("session_id", json!(session.id)),
                    ("run_id", json!(session.run_id)),
                    ("query", json!(session.query.query)),
                    ("user_id", json!(session.user_id)),
                    ("estimated_stages", json!(self.config.max_stages)),
                ]),
                None,
            )
            .await;
        Ok(())
    }

    /// Run stages `from..=to`, honoring pause/containment/timeout at
    /// each boundary.
    async fn drive(&self, session_id: &str, from: u8, to: u8) -> Result<(), PipelineError> {
        let mut prev_confidence = self
            .load(session_id)?
            .last_stage()
            .map_or(0.0, |s| s.confidence.score);

        for stage_number in from..=to {
            // External pause/containment lands here, between stages.
            let mut session = self.load(session_id)?;
            match session.status {
                SessionStatus::Paused => {
                    info!(session = session_id, "pause observed; leaving ladder");
                    return Ok(());
                }
                status if status.is_terminal() => return Ok(()),
                _ => {}
            }

            let started = session
                .state
                .get("start_time")
                .and_then(Value::as_f64)
                .unwrap_or_else(now_epoch_seconds);
            if now_epoch_seconds() - started > self.config.max_simulation_time.as_secs_f64() {
                warn!(session = session_id, "simulation budget exhausted");
                session.status = SessionStatus::Failed;
                session
                    .state
                    .insert("error".to_string(), json!("simulation timeout"));
                self.store.update(session);
                return Ok(());
            }

            let input = Self::working_input(&session);
            match self
                .execute_stage(&mut session, stage_number, &input, prev_confidence)
                .await?
            {
                Some(commit) => {
                    prev_confidence = commit.result.confidence;
                    if commit.certificate.is_some() {
                        return Ok(());
                    }
                    let session = self.load(session_id)?;
                    if session.is_terminal() {
                        return Ok(());
                    }
                }
                None => {
                    // Unregistered stage: logged and skipped.
                    continue;
                }
            }
        }
        Ok(())
    }

    /// Execute and commit one stage. `Ok(None)` means the stage number
    /// is not registered and was skipped.
    async fn execute_stage(
        &self,
        session: &mut Session,
        stage_number: u8,
        input: &JsonMap,
        prev_confidence: f64,
    ) -> Result<Option<StageCommit>, PipelineError> {
        let Some(stage) = self.stages.get(stage_number) else {
            warn!(stage = stage_number, "stage not registered; skipping");
            return Ok(None);
        };
        let profile = stage.profile().clone();
        let session_id = session.id.clone();

        self.hub
            .broadcast_session(
                &session_id,
                MessageType::LayerStarted,
                json_map([
                    ("layer", json!(stage_number)),
                    ("name", json!(profile.name)),
                ]),
                None,
            )
            .await;

        // Attach whatever agents the stage requisitions.
        let coordinate = Self::coordinate_of(session);
        let mut attached: Vec<String> = Vec::new();
        if profile.requires_agents {
            attached = match stage.agent_requisition() {
                Some(AgentRequisition::Research {
                    count,
                    specializations,
                }) => self
                    .agents
                    .spawn_research(count, &coordinate, specializations.as_deref()),
                Some(AgentRequisition::Perspective { stakeholders }) => {
                    self.agents.spawn_perspective(&stakeholders, &coordinate)
                }
                None => Vec::new(),
            };
            for agent_id in &attached {
                self.hub
                    .broadcast_session(
                        &session_id,
                        MessageType::AgentSpawned,
                        json_map([
                            ("agent_id", json!(agent_id)),
                            ("layer", json!(stage_number)),
                        ]),
                        None,
                    )
                    .await;
            }
        }

        let ctx = StageContext {
            memory: Arc::clone(&self.memory),
            agents: Arc::clone(&self.agents),
            plugins: Arc::clone(&self.plugins),
            dispatch: Arc::clone(&self.dispatch),
            audit: Arc::clone(&self.audit),
            session_id: session_id.clone(),
            run_id: session.run_id.clone(),
            coordinate,
            attached_agents: attached.clone(),
        };

        let timer = Instant::now();
        let mut result = match stage.process(input, &mut session.state, &ctx).await {
            Ok(result) => result,
            Err(err) => {
                warn!(stage = stage_number, %err, "stage failed; synthesizing failure result");
                session
                    .state
                    .insert("stage_failure".to_string(), json!(true));
                StageResult::failure(input, stage_number, &err.to_string())
            }
        };
        result.processing_time_ms = timer.elapsed().as_millis() as u64;

        // Stage completion releases its agents.
        for agent_id in &attached {
            self.agents.deactivate(agent_id);
        }

        let failed = result
            .metadata
            .get("failed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let status = if failed {
            StageStatus::Failed
        } else if result.confidence < 0.5 || result.escalate {
            StageStatus::Escalated
        } else {
            StageStatus::Completed
        };

        let confidence = ConfidenceScore {
            stage: stage_number,
            score: result.confidence,
            delta: result.confidence - prev_confidence,
            entropy: result.entropy(),
        };

        let mut trace = vec![TraceStep {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            stage: stage_number,
            stage_name: profile.name.clone(),
            kind: TraceEventKind::LayerEntry,
            message: format!("stage {stage_number} ({}) -> {status:?}", profile.name),
            confidence: confidence.clone(),
            input_snapshot: input.clone(),
            output_snapshot: result.output.clone(),
            agent: None,
            persona: None,
        }];
        if status == StageStatus::Escalated {
            trace.push(TraceStep {
                id: uuid::Uuid::new_v4(),
                timestamp: chrono::Utc::now(),
                stage: stage_number,
                stage_name: profile.name.clone(),
                kind: TraceEventKind::Escalation,
                message: format!(
                    "stage {stage_number} escalated (confidence {:.3})",
                    result.confidence
                ),
                confidence: confidence.clone(),
                input_snapshot: JsonMap::new(),
                output_snapshot: JsonMap::new(),
                agent: None,
                persona: None,
            });
        }

        let committed = session.push_stage(StageState {
            stage: stage_number,
            name: profile.name.clone(),
            status,
            trace,
            agents: attached.clone(),
            confidence: confidence.clone(),
            forked: !result.forks.is_empty(),
            escalation: result.escalate,
            patches: result.patches.clone(),
        });
        if !committed {
            return Err(PipelineError::Internal {
                message: format!("stage {stage_number} committed out of order"),
            });
        }
        self.store.update(session.clone());

        self.audit
            .entry(
                AuditEventType::SimulationPass,
                json_map([
                    ("stage", json!(stage_number)),
                    ("stage_name", json!(profile.name)),
                    ("status", json!(format!("{status:?}"))),
                    ("processing_time_ms", json!(result.processing_time_ms)),
                ]),
            )
            .stage(stage_number)
            .simulation_id(&session_id)
            .confidence(result.confidence)
            .append();

        self.hub
            .broadcast_session(
                &session_id,
                MessageType::LayerCompleted,
                json_map([
                    ("layer", json!(stage_number)),
                    ("name", json!(profile.name)),
                    ("status", serde_json::to_value(status).unwrap_or_default()),
                    ("confidence", json!(result.confidence)),
                    ("processing_time_ms", json!(result.processing_time_ms)),
                    ("escalate", json!(result.escalate)),
                    ("patches_count", json!(result.patches.len())),
                    ("agents_spawned", json!(result.agents_spawned)),
                ]),
                None,
            )
            .await;

        if status == StageStatus::Escalated {
            self.audit
                .entry(
                    AuditEventType::Escalation,
                    json_map([("stage", json!(stage_number))]),
                )
                .stage(stage_number)
                .simulation_id(&session_id)
                .confidence(result.confidence)
                .append();
            self.hub
                .broadcast_session(
                    &session_id,
                    MessageType::LayerEscalated,
                    json_map([
                        ("layer", json!(stage_number)),
                        ("confidence", json!(result.confidence)),
                    ]),
                    None,
                )
                .await;
        }

        // Forks are data for upstream consumers, never re-executed.
        for fork in &result.forks {
            self.audit
                .entry(
                    AuditEventType::Fork,
                    fork.as_object().cloned().unwrap_or_default(),
                )
                .stage(stage_number)
                .simulation_id(&session_id)
                .append();
            self.hub
                .broadcast_session(
                    &session_id,
                    MessageType::MemoryForked,
                    json_map([("layer", json!(stage_number)), ("fork", fork.clone())]),
                    None,
                )
                .await;
        }
        if !result.patches.is_empty() {
            self.hub
                .broadcast_session(
                    &session_id,
                    MessageType::MemoryPatched,
                    json_map([
                        ("layer", json!(stage_number)),
                        ("patches", json!(result.patches)),
                    ]),
                    None,
                )
                .await;
        }

        // Compliance sees the stage output plus the memory churn
        // recorded alongside it; stage-provided keys take precedence.
        let mut details = result.output.clone();
        details
            .entry("patches_applied")
            .or_insert_with(|| Value::Array(result.patches.clone()));
        details
            .entry("forks")
            .or_insert_with(|| Value::Array(result.forks.clone()));
        let certificate = self.compliance.check_and_log(
            stage_number,
            &details,
            Some(result.confidence),
            None,
            Some(&session_id),
        );

        if let Some(cert) = &certificate {
            let mut session = self.load(&session_id)?;
            if let Some(last) = session.stages.last_mut() {
                last.status = StageStatus::Contained;
                last.trace.push(TraceStep {
                    id: uuid::Uuid::new_v4(),
                    timestamp: chrono::Utc::now(),
                    stage: stage_number,
                    stage_name: profile.name.clone(),
                    kind: TraceEventKind::Containment,
                    message: format!("containment triggered at stage {stage_number}"),
                    confidence: confidence.clone(),
                    input_snapshot: JsonMap::new(),
                    output_snapshot: JsonMap::new(),
                    agent: None,
                    persona: None,
                });
            }
            session.status = SessionStatus::Contained;
            self.store.update(session);
            self.hub
                .broadcast_session(
                    &session_id,
                    MessageType::ContainmentTriggered,
                    json_map([
                        ("layer", json!(stage_number)),
                        ("cert_id", json!(cert.cert_id.to_string())),
                        ("cert_hash", json!(cert.cert_hash)),
                    ]),
                    None,
                )
                .await;
        } else if !result.escalate
            && result.confidence >= self.config.global_confidence_threshold
        {
            // Boundary inclusive: confidence exactly at the threshold
            // completes here.
            let mut session = self.load(&session_id)?;
            session.status = SessionStatus::Completed;
            session.final_output = Some(result.output.clone());
            self.store.update(session);
            info!(
                session = %session_id,
                stage = stage_number,
                confidence = result.confidence,
                "simulation completed"
            );
        }

        Ok(Some(StageCommit {
            result,
            certificate,
        }))
    }

    /// Resolve the exhaustion policy and emit terminal events.
    async fn finish(&self, session_id: &str) -> Result<RunOutcome, PipelineError> {
        let mut session = self.load(session_id)?;

        if session.status == SessionStatus::Running {
            // Ladder exhausted without early completion: the last
            // stage's output stands as the final answer when it has one.
            let adopted = session
                .last_stage()
                .and_then(|s| s.trace.first())
                .map(|t| t.output_snapshot.clone())
                .filter(|o| !o.is_empty());
            match adopted {
                Some(output) => {
                    session.status = SessionStatus::Completed;
                    session.final_output = Some(output);
                }
                None => {
                    session.status = SessionStatus::Failed;
                    session
                        .state
                        .insert("error".to_string(), json!("no output produced"));
                }
            }
            self.store.update(session.clone());
        }

        let session = self.load(session_id)?;
        if session.status == SessionStatus::Paused {
            // Mid-run pause: no terminal events yet.
            return Ok(RunOutcome {
                run_id: session.run_id.clone(),
                trace: session.full_trace(),
                final_output: session.final_output.clone(),
                state: session.state.clone(),
                session,
            });
        }

        let elapsed = session
            .state
            .get("start_time")
            .and_then(Value::as_f64)
            .map(|t| now_epoch_seconds() - t);
        self.hub
            .broadcast_session(
                session_id,
                MessageType::SimulationCompleted,
                json_map([
                    ("session_id", json!(session.id)),
                    ("run_id", json!(session.run_id)),
                    ("status", serde_json::to_value(session.status).unwrap_or_default()),
                    ("layers_processed", json!(session.stages.len())),
                    (
                        "final_output",
                        session
                            .final_output
                            .clone()
                            .map_or(Value::Null, Value::Object),
                    ),
                    ("processing_time", json!(elapsed)),
                ]),
                None,
            )
            .await;
        if session.status == SessionStatus::Failed {
            self.hub
                .broadcast_session(
                    session_id,
                    MessageType::SimulationError,
                    json_map([(
                        "error",
                        session
                            .state
                            .get("error")
                            .cloned()
                            .unwrap_or_else(|| json!("simulation failed")),
                    )]),
                    None,
                )
                .await;
        }
        self.audit
            .entry(
                AuditEventType::SimulationEnd,
                json_map([(
                    "status",
                    serde_json::to_value(session.status).unwrap_or_default(),
                )]),
            )
            .simulation_id(session_id)
            .append();

        Ok(RunOutcome {
            run_id: session.run_id.clone(),
            trace: session.full_trace(),
            final_output: session.final_output.clone(),
            state: session.state.clone(),
            session,
        })
    }

    fn coordinate_of(session: &Session) -> Coordinate {
        session
            .query
            .coordinate
            .clone()
            .unwrap_or_else(Coordinate::origin)
    }

    /// The payload the next stage consumes: the previous stage's output,
    /// or the raw query for a fresh session.
    fn working_input(session: &Session) -> JsonMap {
        session
            .last_stage()
            .and_then(|s| s.trace.first())
            .map(|t| t.output_snapshot.clone())
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| {
                json_map([
                    ("query", json!(session.query.query)),
                    ("context", Value::Object(session.query.context.clone())),
                ])
            })
    }
}
