//! Builtin knowledge algorithms.
//!
//! Three rule-based KAs ship with the crate: an echo baseline, a query
//! analyzer used by the entry stage, and a risk screen used by the
//! ethics and containment stages. Embedders replace or extend these via
//! [`PluginRegistry::register_factory`](crate::plugins::PluginRegistry::register_factory).

use std::sync::Arc;

use serde_json::{json, Value};

use crate::plugins::{KaFactory, KaOutput, KaRegistration, PluginError};
use crate::utils::{json_map, JsonMap};

/// Words that mark a query as ambiguous enough to need deeper stages.
const AMBIGUITY_MARKERS: [&str; 6] = ["maybe", "might", "unclear", "ambiguous", "depends", "or"];

/// Terms the risk screen treats as ethically sensitive.
const RISK_TERMS: [&str; 8] = [
    "harm",
    "weapon",
    "exploit",
    "surveillance",
    "deceive",
    "irreversible",
    "bypass",
    "unsafe",
];

fn query_of(slice_input: &JsonMap) -> String {
    slice_input
        .get("query")
        .or_else(|| slice_input.get("user_query"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Echo KA: returns its input unchanged at moderate confidence.
pub fn echo_factory() -> Arc<dyn KaFactory> {
    Arc::new(|| {
        Ok(KaRegistration::new(
            "echo",
            json_map([
                ("description", json!("baseline echo algorithm")),
                ("version", json!("1.0")),
            ]),
            Arc::new(|slice_input: &JsonMap, _context: &JsonMap| {
                Ok(KaOutput {
                    output: Value::Object(slice_input.clone()),
                    confidence: 0.75,
                    entropy: 0.05,
                    trace: json!({"notes": "echo passthrough"}),
                })
            }),
        ))
    })
}

/// Query analyzer KA: rule-based triage of the incoming query.
pub fn query_analyzer_factory() -> Arc<dyn KaFactory> {
    Arc::new(|| {
        Ok(KaRegistration::new(
            "query_analyzer",
            json_map([
                ("description", json!("rule-based query triage")),
                ("version", json!("1.0")),
            ]),
            Arc::new(|slice_input: &JsonMap, _context: &JsonMap| {
                let query = query_of(slice_input);
                if query.is_empty() {
                    return Err(PluginError::Runner {
                        name: "query_analyzer".into(),
                        message: "no query in slice input".into(),
                    });
                }
                let lowered = query.to_lowercase();
                let markers: Vec<&str> = AMBIGUITY_MARKERS
                    .iter()
                    .copied()
                    .filter(|m| lowered.split_whitespace().any(|w| w.trim_matches('?') == *m))
                    .collect();
                let word_count = query.split_whitespace().count();
                let complexity = if word_count > 40 {
                    "high"
                } else if word_count > 12 {
                    "medium"
                } else {
                    "low"
                };
                let intent = if lowered.starts_with("why") || lowered.starts_with("how") {
                    "explanatory"
                } else if lowered.contains('?') {
                    "interrogative"
                } else {
                    "declarative"
                };
                let confidence = match (complexity, markers.is_empty()) {
                    ("low", true) => 0.95,
                    ("low", false) | ("medium", true) => 0.85,
                    _ => 0.7,
                };
                Ok(KaOutput {
                    output: json!({
                        "intent": intent,
                        "complexity": complexity,
                        "word_count": word_count,
                        "ambiguity_markers": markers,
                    }),
                    confidence,
                    entropy: if markers.is_empty() { 0.05 } else { 0.2 },
                    trace: json!({"analyzed": query}),
                })
            }),
        ))
    })
}

/// Risk screen KA: scans text for ethically sensitive terms.
pub fn risk_screen_factory() -> Arc<dyn KaFactory> {
    Arc::new(|| {
        Ok(KaRegistration::new(
            "risk_screen",
            json_map([
                ("description", json!("lexical risk screening")),
                ("version", json!("1.0")),
            ]),
            Arc::new(|slice_input: &JsonMap, _context: &JsonMap| {
                let text = query_of(slice_input).to_lowercase();
                let hits: Vec<&str> = RISK_TERMS
                    .iter()
                    .copied()
                    .filter(|term| text.contains(term))
                    .collect();
                let risk_level = match hits.len() {
                    0 => "low",
                    1 => "medium",
                    2 => "high",
                    _ => "critical",
                };
                Ok(KaOutput {
                    output: json!({
                        "risk_terms": hits,
                        "risk_level": risk_level,
                    }),
                    confidence: 0.9,
                    entropy: 0.02,
                    trace: json!({"screened_chars": text.len()}),
                })
            }),
        ))
    })
}

/// Every builtin factory, in registration order.
pub fn default_factories() -> Vec<Arc<dyn KaFactory>> {
    vec![echo_factory(), query_analyzer_factory(), risk_screen_factory()]
}
