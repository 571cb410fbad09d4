//! Shared helpers for integration tests.
//!
//! Each integration test binary compiles its own copy; not every helper
//! is exercised by every binary.
#![allow(dead_code)]

use async_trait::async_trait;
use echelon::hub::Envelope;
use echelon::stages::{Stage, StageContext, StageError, StageProfile, StageRegistry, StageResult};
use serde_json::{json, Value};

pub type JsonMap = serde_json::Map<String, Value>;

/// Configurable scripted stage.
///
/// Passes its input through, overlays `inject` onto the output, and
/// reports the configured confidence/escalation.
pub struct StubStage {
    profile: StageProfile,
    confidence: f64,
    escalate: bool,
    inject: JsonMap,
    patches: Vec<Value>,
    fail: bool,
    empty_output: bool,
}

impl StubStage {
    pub fn new(number: u8, confidence: f64, escalate: bool) -> Self {
        Self {
            profile: StageProfile::new(number, format!("stub stage {number}")),
            confidence,
            escalate,
            inject: JsonMap::new(),
            patches: Vec::new(),
            fail: false,
            empty_output: false,
        }
    }

    /// Overlay extra keys onto the stage output.
    pub fn with_inject(mut self, inject: JsonMap) -> Self {
        self.inject = inject;
        self
    }

    /// Report the given patch records on the stage result.
    pub fn with_patches(mut self, patches: Vec<Value>) -> Self {
        self.patches = patches;
        self
    }

    /// Stage that always errors.
    pub fn failing(number: u8) -> Self {
        let mut stub = Self::new(number, 0.0, true);
        stub.fail = true;
        stub
    }

    /// Stage producing an empty output map.
    pub fn with_empty_output(mut self) -> Self {
        self.empty_output = true;
        self
    }
}

#[async_trait]
impl Stage for StubStage {
    fn profile(&self) -> &StageProfile {
        &self.profile
    }

    async fn process(
        &self,
        input: &JsonMap,
        _state: &mut JsonMap,
        _ctx: &StageContext,
    ) -> Result<StageResult, StageError> {
        if self.fail {
            return Err(StageError::Internal {
                message: "scripted failure".into(),
            });
        }
        let mut output = if self.empty_output {
            JsonMap::new()
        } else {
            let mut out = input.clone();
            out.insert("stub_stage".to_string(), json!(self.profile.number));
            for (k, v) in &self.inject {
                out.insert(k.clone(), v.clone());
            }
            out
        };
        if !self.empty_output && !output.contains_key("query") {
            output.insert("query".to_string(), json!("stub"));
        }
        Ok(StageResult::new(output, self.confidence)
            .escalate(self.escalate)
            .with_patches(self.patches.clone()))
    }
}

/// A ladder of identical escalating stubs covering stages 1..=count.
pub fn escalating_ladder(count: u8, confidence: f64) -> StageRegistry {
    let mut registry = StageRegistry::empty();
    for number in 1..=count {
        registry.register(std::sync::Arc::new(StubStage::new(number, confidence, true)));
    }
    registry
}

/// Drain every frame currently buffered on a transport receiver.
pub fn drain_envelopes(rx: &flume::Receiver<String>) -> Vec<Envelope> {
    let mut envelopes = Vec::new();
    while let Ok(wire) = rx.try_recv() {
        envelopes.push(serde_json::from_str(&wire).expect("well-formed envelope"));
    }
    envelopes
}
