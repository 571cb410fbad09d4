//! End-to-end pipeline scenarios.

mod common;
use common::*;

use std::sync::Arc;
use std::time::Duration;

use echelon::audit::{AuditEventType, AuditFilter};
use echelon::compliance::{Severity, ViolationFilter, ViolationKind};
use echelon::hub::{ChannelTransport, MessageType};
use echelon::pipeline::{
    PipelineConfig, PipelineError, PipelineExecutor, SessionStatus, SimulationQuery, StageStatus,
};
use echelon::stages::StageRegistry;
use serde_json::json;

/// Scenario A: a simple query completes at the entry stage.
#[tokio::test]
async fn simple_completion() {
    let executor = PipelineExecutor::default();
    let outcome = executor
        .run(SimulationQuery::new("What is 2+2?"), None, None)
        .await
        .unwrap();

    let session = executor.store().get(&outcome.session.id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.last_stage().unwrap().confidence.score >= 0.995);
    assert!(session.final_output.is_some());

    // No compliance violations were logged for this session.
    let violations = executor.audit().query(
        &AuditFilter {
            event_type: Some(AuditEventType::ComplianceViolation),
            simulation_id: Some(session.id.clone()),
            ..Default::default()
        },
        100,
        0,
    );
    assert!(violations.is_empty());
}

/// Scenario B: a ladder of escalating stubs runs to stage 10 and
/// completes on the last stage's output.
#[tokio::test]
async fn escalation_chain_exhausts_and_completes() {
    let executor =
        PipelineExecutor::default().with_stage_registry(escalating_ladder(10, 0.6));
    let outcome = executor
        .run(SimulationQuery::new("escalate me"), None, None)
        .await
        .unwrap();

    assert_eq!(outcome.session.stages.len(), 10);
    for stage in &outcome.session.stages {
        assert!(stage.escalation, "stage {} should escalate", stage.stage);
        assert_eq!(stage.status, StageStatus::Escalated);
    }
    // Stage 10's (non-null) output became the final output.
    assert_eq!(outcome.session.status, SessionStatus::Completed);
    assert_eq!(outcome.final_output.unwrap()["stub_stage"], 10);
}

/// Scenario B variant: a null stage-10 output fails the run.
#[tokio::test]
async fn escalation_chain_with_empty_last_output_fails() {
    let mut registry = escalating_ladder(9, 0.6);
    registry.register(Arc::new(StubStage::new(10, 0.6, true).with_empty_output()));
    let executor = PipelineExecutor::default().with_stage_registry(registry);
    let outcome = executor
        .run(SimulationQuery::new("escalate me"), None, None)
        .await
        .unwrap();
    assert_eq!(outcome.session.status, SessionStatus::Failed);
    assert!(outcome.final_output.is_none());
}

/// A stage completing exactly at the global threshold finishes the run.
#[tokio::test]
async fn confidence_exactly_at_threshold_completes() {
    let mut registry = StageRegistry::empty();
    registry.register(Arc::new(StubStage::new(1, 0.995, false)));
    let executor = PipelineExecutor::default().with_stage_registry(registry);
    let outcome = executor
        .run(SimulationQuery::new("boundary"), None, None)
        .await
        .unwrap();
    assert_eq!(outcome.session.status, SessionStatus::Completed);
    assert_eq!(outcome.session.stages.len(), 1);
}

/// Scenario C: an ethics denial at stage 8 contains the run.
#[tokio::test]
async fn ethics_denial_contains_at_stage_eight() {
    let mut registry = escalating_ladder(7, 0.9);
    registry.register(Arc::new(StubStage::new(8, 0.99, false).with_inject(
        serde_json::from_value(json!({
            "ethically_approved": false,
            "ethical_decision": {"reason": "irreversible harm"},
        }))
        .unwrap(),
    )));
    registry.register(Arc::new(StubStage::new(9, 0.99, false)));
    registry.register(Arc::new(StubStage::new(10, 1.0, false)));

    let executor = PipelineExecutor::default().with_stage_registry(registry);

    // Drive by stepping so a client can watch the room.
    let session = executor
        .store()
        .create(SimulationQuery::new("do the irreversible thing"), None);
    let (transport, rx) = ChannelTransport::pair();
    assert!(executor.hub().connect(transport, "watcher", &session.id).await);

    let result = executor.step_to(&session.id, 10).await.unwrap();
    assert_eq!(result.len(), 8, "no stage beyond 8 executed");

    let stored = executor.store().get(&session.id).unwrap();
    assert_eq!(stored.status, SessionStatus::Contained);
    assert_eq!(stored.stages.len(), 8);
    assert_eq!(stored.last_stage().unwrap().status, StageStatus::Contained);

    // Critical ethical violation on record.
    let violations = executor.compliance().violations(&ViolationFilter {
        severity: Some(Severity::Critical),
        ..Default::default()
    });
    assert!(violations
        .iter()
        .any(|v| v.kind == ViolationKind::EthicalApprovalDenied && v.stage == 8));

    // Containment certificate minted, audited, and verifiable.
    let triggers = executor.audit().query(
        &AuditFilter::event(AuditEventType::ContainmentTrigger),
        10,
        0,
    );
    assert_eq!(triggers.len(), 1);
    let cert = triggers[0].certificate.as_ref().unwrap();
    assert!(cert.verify());
    assert_eq!(cert.origin_layer, Some(8));

    // The room saw the containment_triggered frame.
    let frames = drain_envelopes(&rx);
    assert!(frames
        .iter()
        .any(|e| e.message_type == MessageType::ContainmentTriggered));
}

/// A stage that errors is recovered as a low-confidence escalation.
#[tokio::test]
async fn failing_stage_synthesizes_failure_result() {
    let mut registry = StageRegistry::empty();
    registry.register(Arc::new(StubStage::failing(1)));
    registry.register(Arc::new(StubStage::new(2, 0.996, false)));
    let executor = PipelineExecutor::default().with_stage_registry(registry);
    let outcome = executor
        .run(SimulationQuery::new("please fail"), None, None)
        .await
        .unwrap();

    let first = &outcome.session.stages[0];
    assert_eq!(first.status, StageStatus::Failed);
    assert!((first.confidence.score - 0.1).abs() < 1e-9);
    assert!(first.escalation);
    // The pipeline continued and completed on stage 2.
    assert_eq!(outcome.session.status, SessionStatus::Completed);
    assert_eq!(outcome.session.stages.len(), 2);
}

/// Unregistered stage numbers are skipped with a warning.
#[tokio::test]
async fn missing_stages_are_skipped() {
    let mut registry = StageRegistry::empty();
    registry.register(Arc::new(StubStage::new(1, 0.6, true)));
    registry.register(Arc::new(StubStage::new(5, 0.996, false)));
    let executor = PipelineExecutor::default().with_stage_registry(registry);
    let outcome = executor
        .run(SimulationQuery::new("sparse ladder"), None, None)
        .await
        .unwrap();
    let numbers: Vec<u8> = outcome.session.stages.iter().map(|s| s.stage).collect();
    assert_eq!(numbers, vec![1, 5]);
    assert_eq!(outcome.session.status, SessionStatus::Completed);
}

/// Stepping follows the same commit rules as the driving loop: a step
/// skips unregistered numbers and lands on the next registered stage.
#[tokio::test]
async fn step_skips_unregistered_stages() {
    let mut registry = StageRegistry::empty();
    registry.register(Arc::new(StubStage::new(1, 0.6, true)));
    registry.register(Arc::new(StubStage::new(5, 0.6, true)));
    let executor = PipelineExecutor::default().with_stage_registry(registry);
    let session = executor
        .store()
        .create(SimulationQuery::new("sparse steps"), None);

    executor.step(&session.id).await.unwrap();
    assert_eq!(executor.store().get(&session.id).unwrap().current_stage, 1);

    // Stages 2-4 are not registered; the next step lands on stage 5.
    let result = executor.step(&session.id).await.unwrap();
    assert_eq!(result.output["stub_stage"], 5);
    let stored = executor.store().get(&session.id).unwrap();
    assert_eq!(stored.current_stage, 5);
    let numbers: Vec<u8> = stored.stages.iter().map(|s| s.stage).collect();
    assert_eq!(numbers, vec![1, 5]);
    assert_eq!(stored.status, SessionStatus::Paused);

    // Beyond stage 5 only unregistered numbers remain.
    let err = executor.step(&session.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::PastFinalStage { .. }));
    assert_eq!(
        executor.store().get(&session.id).unwrap().status,
        SessionStatus::Paused
    );
}

/// Memory churn reported on a stage result reaches the compliance
/// engine even though stages never write the counts into their outputs.
#[tokio::test]
async fn excessive_patches_raise_memory_integrity_violation() {
    let patches: Vec<serde_json::Value> = (0..11).map(|i| json!({"op": i})).collect();
    let mut registry = StageRegistry::empty();
    registry.register(Arc::new(StubStage::new(1, 0.996, false).with_patches(patches)));
    let executor = PipelineExecutor::default().with_stage_registry(registry);
    let outcome = executor
        .run(SimulationQuery::new("heavy churn"), None, None)
        .await
        .unwrap();

    // High severity, not critical: the run still completes.
    assert_eq!(outcome.session.status, SessionStatus::Completed);
    let violations = executor.compliance().violations(&ViolationFilter::default());
    assert!(violations
        .iter()
        .any(|v| v.kind == ViolationKind::MemoryIntegrityViolation && v.stage == 1));
    assert!(violations
        .iter()
        .all(|v| v.severity != Severity::Critical));
}

/// A zero wall-clock budget fails before the first stage.
#[tokio::test]
async fn session_budget_is_enforced() {
    let executor = PipelineExecutor::new(
        PipelineConfig::default().with_max_simulation_time(Duration::from_secs(0)),
    )
    .with_stage_registry(escalating_ladder(10, 0.6));
    let outcome = executor
        .run(SimulationQuery::new("too slow"), None, None)
        .await
        .unwrap();
    assert_eq!(outcome.session.status, SessionStatus::Failed);
    assert!(outcome.session.stages.is_empty());
    assert_eq!(outcome.state["error"], "simulation timeout");
}

/// Stepping: forward only, never past the final stage, never on a
/// terminal session.
#[tokio::test]
async fn stepping_policy_errors() {
    let executor = PipelineExecutor::default()
        .with_config(PipelineConfig::default().with_max_stages(2))
        .with_stage_registry(escalating_ladder(2, 0.6));
    let session = executor
        .store()
        .create(SimulationQuery::new("step me"), None);

    let first = executor.step(&session.id).await.unwrap();
    assert!((first.confidence - 0.6).abs() < 1e-9);
    assert_eq!(
        executor.store().get(&session.id).unwrap().status,
        SessionStatus::Paused
    );

    // Backward stepping is rejected without state change.
    assert!(matches!(
        executor.step_to(&session.id, 1).await,
        Err(PipelineError::BackwardStep { from: 1, to: 1 })
    ));

    executor.step(&session.id).await.unwrap();
    // Past the final stage: policy error, session untouched.
    let before = executor.store().get(&session.id).unwrap();
    let err = executor.step(&session.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::PastFinalStage { stage: 3 }));
    let after = executor.store().get(&session.id).unwrap();
    assert_eq!(before.stages.len(), after.stages.len());
    assert_eq!(before.status, after.status);
}

#[tokio::test]
async fn terminal_sessions_cannot_be_driven() {
    let executor = PipelineExecutor::default();
    let outcome = executor
        .run(SimulationQuery::new("What is 2+2?"), None, None)
        .await
        .unwrap();
    let id = outcome.session.id.clone();
    assert!(matches!(
        executor.step(&id).await,
        Err(PipelineError::SessionTerminal { .. })
    ));
    assert!(matches!(
        executor.pause(&id).await,
        Err(PipelineError::SessionTerminal { .. })
    ));
    assert!(matches!(
        executor.resume(&id).await,
        Err(PipelineError::SessionNotPaused { .. })
    ));
}

/// Pause parks the session; resume finishes the ladder.
#[tokio::test]
async fn pause_and_resume_round_trip() {
    let executor = PipelineExecutor::default().with_stage_registry(escalating_ladder(10, 0.6));
    let session = executor
        .store()
        .create(SimulationQuery::new("pausable"), None);

    executor.step(&session.id).await.unwrap();
    executor.step(&session.id).await.unwrap();
    let paused = executor.store().get(&session.id).unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);
    assert_eq!(paused.current_stage, 2);

    let outcome = executor.resume(&session.id).await.unwrap();
    assert_eq!(outcome.session.stages.len(), 10);
    assert_eq!(outcome.session.status, SessionStatus::Completed);
}

/// Manual containment short-circuits and certifies.
#[tokio::test]
async fn manual_containment_forces_terminal_state() {
    let executor = PipelineExecutor::default().with_stage_registry(escalating_ladder(10, 0.6));
    let session = executor
        .store()
        .create(SimulationQuery::new("contain me"), None);
    executor.step(&session.id).await.unwrap();

    let cert = executor.contain(&session.id, "operator decision").await.unwrap();
    assert!(cert.verify());
    let stored = executor.store().get(&session.id).unwrap();
    assert_eq!(stored.status, SessionStatus::Contained);

    // Terminal now: further driving is rejected.
    assert!(matches!(
        executor.step(&session.id).await,
        Err(PipelineError::SessionTerminal { .. })
    ));
}

/// Audit trail brackets every run with start and end entries.
#[tokio::test]
async fn runs_are_bracketed_in_the_audit_log() {
    let executor = PipelineExecutor::default();
    let outcome = executor
        .run(SimulationQuery::new("What is 2+2?"), None, None)
        .await
        .unwrap();
    let entries = executor
        .audit()
        .query(&AuditFilter::simulation(&outcome.session.id), 100, 0);
    let kinds: Vec<AuditEventType> = entries.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds.first(), Some(&AuditEventType::SimulationStart));
    assert_eq!(kinds.last(), Some(&AuditEventType::SimulationEnd));
    assert!(kinds.contains(&AuditEventType::SimulationPass));
    for entry in &entries {
        assert!(entry.verify(), "entry {} fails verification", entry.entry_id);
    }
}
