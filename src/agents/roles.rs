//! Built-in agent roles: researchers and stakeholder perspectives.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::{now, short_id, Agent, AgentError, AgentProfile, AgentReport};
use crate::coordinate::Coordinate;
use crate::utils::{json_map, JsonMap};

/// Personas cycled through when spawning research agents.
pub const PERSONA_POOL: [&str; 6] = [
    "domain_expert",
    "critical_thinker",
    "creative_reasoner",
    "safety_analyst",
    "synthesizer",
    "qa_expert",
];

/// Stakeholder types available to the perspective sweep.
pub const STAKEHOLDER_POOL: [&str; 7] = [
    "users",
    "developers",
    "investors",
    "regulators",
    "competitors",
    "society",
    "environment",
];

fn query_of(input: &JsonMap) -> String {
    input
        .get("query")
        .or_else(|| input.get("user_query"))
        .and_then(Value::as_str)
        .unwrap_or("the question at hand")
        .to_string()
}

/// Rule-based research agent.
///
/// Each persona applies a different lens and confidence posture; the
/// output is deterministic for a given query so pipeline runs stay
/// reproducible without an LLM in the loop.
pub struct ResearchAgent {
    profile: AgentProfile,
    specialization: String,
}

impl ResearchAgent {
    pub fn new(persona: &str, coordinate: Coordinate, specialization: &str) -> Self {
        Self {
            profile: AgentProfile {
                agent_id: format!("research_{}", short_id()),
                persona: persona.to_string(),
                role: "researcher".to_string(),
                coordinate,
                created_at: now(),
            },
            specialization: specialization.to_string(),
        }
    }

    fn findings(&self, query: &str) -> (f64, String, String) {
        match self.profile.persona.as_str() {
            "domain_expert" => (
                0.9,
                format!("domain expertise applied to '{query}'"),
                format!("specialized consideration of {query} within {}", self.specialization),
            ),
            "critical_thinker" => (
                0.75,
                format!("critical analysis of '{query}'"),
                format!("underlying assumptions in {query} need validation"),
            ),
            "creative_reasoner" => (
                0.7,
                format!("alternative approaches explored for '{query}'"),
                format!("non-obvious methodologies may apply to {query}"),
            ),
            "safety_analyst" => (
                0.85,
                format!("safety assessment of '{query}'"),
                format!("{query} carries acceptable risk with precautions"),
            ),
            _ => (
                0.8,
                format!("general research on '{query}'"),
                format!("standard approaches are applicable to {query}"),
            ),
        }
    }
}

#[async_trait]
impl Agent for ResearchAgent {
    fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    async fn process(
        &self,
        input: &JsonMap,
        _context: &JsonMap,
    ) -> Result<AgentReport, AgentError> {
        let query = query_of(input);
        let (confidence, reasoning, answer) = self.findings(&query);
        Ok(AgentReport {
            agent_id: self.profile.agent_id.clone(),
            persona: self.profile.persona.clone(),
            answer: Value::String(answer),
            confidence,
            reasoning,
            extras: json_map([("specialization", json!(self.specialization))]),
        })
    }
}

/// Stakeholder point-of-view agent.
pub struct PerspectiveAgent {
    profile: AgentProfile,
    stakeholder: String,
}

impl PerspectiveAgent {
    pub fn new(stakeholder: &str, coordinate: Coordinate) -> Self {
        Self {
            profile: AgentProfile {
                agent_id: format!("pov_{}_{}", stakeholder, short_id()),
                persona: format!("{stakeholder}_representative"),
                role: "pov_analyst".to_string(),
                coordinate,
                created_at: now(),
            },
            stakeholder: stakeholder.to_string(),
        }
    }

    fn concerns(&self) -> Vec<&'static str> {
        match self.stakeholder.as_str() {
            "users" => vec!["usability", "privacy", "cost"],
            "developers" => vec!["feasibility", "resources", "technical_debt"],
            "regulators" => vec!["compliance", "safety", "fairness"],
            "investors" => vec!["profitability", "risk", "market_impact"],
            "society" => vec!["equity", "externalities"],
            "environment" => vec!["footprint", "sustainability"],
            _ => vec!["impact", "risk"],
        }
    }

    fn priorities(&self) -> Vec<&'static str> {
        match self.stakeholder.as_str() {
            "users" => vec!["value", "ease_of_use", "reliability"],
            "developers" => vec!["maintainability", "performance", "scalability"],
            "regulators" => vec!["public_safety", "fair_competition", "transparency"],
            "investors" => vec!["return", "growth_potential", "risk_mitigation"],
            _ => vec!["benefit", "sustainability"],
        }
    }
}

#[async_trait]
impl Agent for PerspectiveAgent {
    fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    async fn process(
        &self,
        input: &JsonMap,
        _context: &JsonMap,
    ) -> Result<AgentReport, AgentError> {
        let query = query_of(input);
        Ok(AgentReport {
            agent_id: self.profile.agent_id.clone(),
            persona: self.profile.persona.clone(),
            answer: json!({
                "perspective": format!("from the {} perspective, {query} shifts priorities", self.stakeholder),
                "stakeholder": self.stakeholder,
            }),
            confidence: 0.8,
            reasoning: format!("stakeholder analysis for {}", self.stakeholder),
            extras: json_map([
                ("stakeholder_type", json!(self.stakeholder)),
                ("concerns", json!(self.concerns())),
                ("priorities", json!(self.priorities())),
            ]),
        })
    }
}
