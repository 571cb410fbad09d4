//! Team execution results and consensus math.

use serde::{Deserialize, Serialize};

use crate::agents::AgentReport;

/// Qualitative agreement buckets over a team's confidence spread.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Agreement {
    High,
    Medium,
    Low,
}

/// Consensus metrics over the surviving agent reports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Consensus {
    /// `max(0, 1 - variance)` of the member confidences.
    pub consensus_strength: f64,
    /// Mean member confidence.
    pub team_confidence: f64,
    pub confidence_variance: f64,
    pub agent_count: usize,
    pub agreement: Agreement,
}

impl Consensus {
    /// Compute consensus over a set of reports.
    ///
    /// An empty set yields zero strength and confidence — a team whose
    /// members all failed must not look confident.
    pub fn analyze(reports: &[AgentReport]) -> Self {
        if reports.is_empty() {
            return Self {
                consensus_strength: 0.0,
                team_confidence: 0.0,
                confidence_variance: 0.0,
                agent_count: 0,
                agreement: Agreement::Low,
            };
        }
        let n = reports.len() as f64;
        let mean = reports.iter().map(|r| r.confidence).sum::<f64>() / n;
        let variance = reports
            .iter()
            .map(|r| (r.confidence - mean).powi(2))
            .sum::<f64>()
            / n;
        let strength = (1.0 - variance).max(0.0);
        let agreement = if strength >= 0.8 {
            Agreement::High
        } else if strength >= 0.5 {
            Agreement::Medium
        } else {
            Agreement::Low
        };
        Self {
            consensus_strength: strength,
            team_confidence: mean,
            confidence_variance: variance,
            agent_count: reports.len(),
            agreement,
        }
    }
}

/// Result of running a team over one input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TeamReport {
    pub team_id: String,
    pub agent_reports: Vec<AgentReport>,
    pub consensus: Consensus,
}

impl TeamReport {
    pub fn team_confidence(&self) -> f64 {
        self.consensus.team_confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn report(confidence: f64) -> AgentReport {
        AgentReport {
            agent_id: "a".into(),
            persona: "p".into(),
            answer: Value::Null,
            confidence,
            reasoning: String::new(),
            extras: Default::default(),
        }
    }

    #[test]
    fn unanimous_team_has_high_agreement() {
        let consensus = Consensus::analyze(&[report(0.9), report(0.9), report(0.9)]);
        assert_eq!(consensus.agreement, Agreement::High);
        assert!((consensus.team_confidence - 0.9).abs() < 1e-9);
        assert!((consensus.consensus_strength - 1.0).abs() < 1e-9);
    }

    #[test]
    fn spread_confidences_lower_strength() {
        let tight = Consensus::analyze(&[report(0.8), report(0.82)]);
        let wide = Consensus::analyze(&[report(0.1), report(0.9)]);
        assert!(tight.consensus_strength > wide.consensus_strength);
        assert!(wide.confidence_variance > tight.confidence_variance);
    }

    #[test]
    fn empty_team_is_low_and_zero() {
        let consensus = Consensus::analyze(&[]);
        assert_eq!(consensus.agreement, Agreement::Low);
        assert_eq!(consensus.team_confidence, 0.0);
        assert_eq!(consensus.agent_count, 0);
    }

    #[test]
    fn agreement_boundaries_are_inclusive() {
        // variance 0.2 -> strength exactly 0.8
        let c = Consensus::analyze(&[
            report(0.5 - 0.2_f64.sqrt()),
            report(0.5 + 0.2_f64.sqrt()),
        ]);
        assert!((c.consensus_strength - 0.8).abs() < 1e-9);
        assert_eq!(c.agreement, Agreement::High);
    }
}
