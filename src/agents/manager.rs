//! Central agent lifecycle management.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::agents::{
    short_id, Agent, AgentError, AgentProfile, AgentReport, Consensus, PerspectiveAgent,
    ResearchAgent, TeamReport, PERSONA_POOL,
};
use crate::coordinate::Coordinate;
use crate::utils::JsonMap;

/// One entry in an agent's activity log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentTraceEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub data: JsonMap,
}

/// Aggregate counters over the managed agents.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentStats {
    pub total_agents: usize,
    pub active_agents: usize,
    pub inactive_agents: usize,
    pub teams: usize,
    pub persona_distribution: std::collections::BTreeMap<String, usize>,
}

struct AgentSlot {
    agent: Arc<dyn Agent>,
    active: bool,
    trace: Vec<AgentTraceEvent>,
}

impl AgentSlot {
    fn log(&mut self, event: &str, data: JsonMap) {
        self.trace.push(AgentTraceEvent {
            timestamp: Utc::now(),
            event: event.to_string(),
            data,
        });
    }
}

#[derive(Default)]
struct ManagerInner {
    agents: FxHashMap<String, AgentSlot>,
    teams: FxHashMap<String, Vec<String>>,
}

/// Spawns, tracks, and coordinates stage agents.
///
/// One manager is shared process-wide; stages reference agents by id and
/// run them through teams.
pub struct AgentManager {
    inner: RwLock<ManagerInner>,
}

impl Default for AgentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ManagerInner::default()),
        }
    }

    /// Register a custom agent.
    pub fn register(&self, agent: Arc<dyn Agent>) -> String {
        let id = agent.profile().agent_id.clone();
        let mut inner = self.inner.write();
        let mut slot = AgentSlot {
            agent,
            active: true,
            trace: Vec::new(),
        };
        slot.log("spawned", JsonMap::new());
        inner.agents.insert(id.clone(), slot);
        id
    }

    /// Spawn `count` research agents cycling through the persona pool.
    pub fn spawn_research(
        &self,
        count: usize,
        coordinate: &Coordinate,
        specializations: Option<&[String]>,
    ) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let persona = PERSONA_POOL[i % PERSONA_POOL.len()];
            let specialization = specializations
                .and_then(|s| s.get(i % s.len().max(1)))
                .map_or("general", String::as_str);
            let agent = ResearchAgent::new(persona, coordinate.clone(), specialization);
            info!(agent = %agent.profile().agent_id, persona, "spawned research agent");
            ids.push(self.register(Arc::new(agent)));
        }
        ids
    }

    /// Spawn one perspective agent per stakeholder type.
    pub fn spawn_perspective(
        &self,
        stakeholders: &[String],
        coordinate: &Coordinate,
    ) -> Vec<String> {
        stakeholders
            .iter()
            .map(|stakeholder| {
                let agent = PerspectiveAgent::new(stakeholder, coordinate.clone());
                info!(agent = %agent.profile().agent_id, stakeholder, "spawned perspective agent");
                self.register(Arc::new(agent))
            })
            .collect()
    }

    /// Group existing agents into a team. Unknown ids are dropped.
    pub fn create_team(&self, agent_ids: &[String], name: Option<&str>) -> String {
        let team_id = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("team_{}", short_id()));
        let mut inner = self.inner.write();
        let members: Vec<String> = agent_ids
            .iter()
            .filter(|id| inner.agents.contains_key(*id))
            .cloned()
            .collect();
        info!(team = %team_id, members = members.len(), "created agent team");
        inner.teams.insert(team_id.clone(), members);
        team_id
    }

    /// Run every active member of a team and compute consensus.
    ///
    /// A member that fails is logged and elided; the team completes on
    /// the remaining reports.
    pub async fn run_team(
        &self,
        team_id: &str,
        input: &JsonMap,
        context: &JsonMap,
    ) -> Result<TeamReport, AgentError> {
        let members: Vec<(String, Arc<dyn Agent>)> = {
            let inner = self.inner.read();
            let ids = inner
                .teams
                .get(team_id)
                .ok_or_else(|| AgentError::TeamNotFound {
                    team_id: team_id.to_string(),
                })?;
            ids.iter()
                .filter_map(|id| {
                    inner
                        .agents
                        .get(id)
                        .filter(|slot| slot.active)
                        .map(|slot| (id.clone(), Arc::clone(&slot.agent)))
                })
                .collect()
        };

        let runs = members
            .iter()
            .map(|(_, agent)| agent.process(input, context));
        let outcomes = join_all(runs).await;

        let mut reports: Vec<AgentReport> = Vec::with_capacity(outcomes.len());
        for ((agent_id, _), outcome) in members.iter().zip(outcomes) {
            match outcome {
                Ok(report) => {
                    let mut inner = self.inner.write();
                    if let Some(slot) = inner.agents.get_mut(agent_id) {
                        slot.log(
                            "processed",
                            crate::utils::json_map([("confidence", json!(report.confidence))]),
                        );
                    }
                    reports.push(report);
                }
                Err(err) => {
                    warn!(agent = %agent_id, %err, "team member failed; eliding from result");
                }
            }
        }

        Ok(TeamReport {
            team_id: team_id.to_string(),
            consensus: Consensus::analyze(&reports),
            agent_reports: reports,
        })
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentProfile> {
        self.inner
            .read()
            .agents
            .get(agent_id)
            .map(|slot| slot.agent.profile().clone())
    }

    /// Deactivate an agent. Returns whether it existed.
    pub fn deactivate(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.agents.get_mut(agent_id) {
            Some(slot) => {
                slot.active = false;
                slot.log("deactivated", JsonMap::new());
                true
            }
            None => false,
        }
    }

    pub fn active_agents(&self) -> Vec<AgentProfile> {
        self.inner
            .read()
            .agents
            .values()
            .filter(|slot| slot.active)
            .map(|slot| slot.agent.profile().clone())
            .collect()
    }

    /// Activity log for one agent.
    pub fn agent_trace(&self, agent_id: &str) -> Vec<AgentTraceEvent> {
        self.inner
            .read()
            .agents
            .get(agent_id)
            .map(|slot| slot.trace.clone())
            .unwrap_or_default()
    }

    /// Drop deactivated agents. Returns how many were removed.
    pub fn cleanup_inactive(&self) -> usize {
        let mut inner = self.inner.write();
        let before = inner.agents.len();
        inner.agents.retain(|_, slot| slot.active);
        let removed = before - inner.agents.len();
        let live: Vec<String> = inner.agents.keys().cloned().collect();
        for members in inner.teams.values_mut() {
            members.retain(|id| live.contains(id));
        }
        if removed > 0 {
            info!(removed, "cleaned up inactive agents");
        }
        removed
    }

    pub fn stats(&self) -> AgentStats {
        let inner = self.inner.read();
        let total = inner.agents.len();
        let active = inner.agents.values().filter(|s| s.active).count();
        let mut persona_distribution = std::collections::BTreeMap::new();
        for slot in inner.agents.values() {
            *persona_distribution
                .entry(slot.agent.profile().persona.clone())
                .or_insert(0) += 1;
        }
        AgentStats {
            total_agents: total,
            active_agents: active,
            inactive_agents: total - active,
            teams: inner.teams.len(),
            persona_distribution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::json_map;
    use async_trait::async_trait;

    fn coord() -> Coordinate {
        Coordinate::builder("PL03").build().unwrap()
    }

    #[test]
    fn research_spawn_cycles_personas() {
        let manager = AgentManager::new();
        let ids = manager.spawn_research(8, &coord(), None);
        assert_eq!(ids.len(), 8);
        let stats = manager.stats();
        assert_eq!(stats.active_agents, 8);
        // 8 agents over a 6-persona pool: two personas appear twice.
        assert_eq!(stats.persona_distribution.len(), 6);
        assert_eq!(stats.persona_distribution["domain_expert"], 2);
    }

    #[tokio::test]
    async fn team_runs_and_reaches_consensus() {
        let manager = AgentManager::new();
        let ids = manager.spawn_research(3, &coord(), None);
        let team = manager.create_team(&ids, Some("panel"));
        let report = manager
            .run_team(&team, &json_map([("query", json!("assess rollout"))]), &JsonMap::new())
            .await
            .unwrap();
        assert_eq!(report.agent_reports.len(), 3);
        assert!(report.team_confidence() > 0.0);
        assert_eq!(report.team_id, "panel");
    }

    #[tokio::test]
    async fn failing_member_is_elided() {
        struct FailingAgent {
            profile: AgentProfile,
        }
        #[async_trait]
        impl Agent for FailingAgent {
            fn profile(&self) -> &AgentProfile {
                &self.profile
            }
            async fn process(
                &self,
                _input: &JsonMap,
                _context: &JsonMap,
            ) -> Result<AgentReport, AgentError> {
                Err(AgentError::Process {
                    agent_id: self.profile.agent_id.clone(),
                    message: "simulated failure".into(),
                })
            }
        }

        let manager = AgentManager::new();
        let mut ids = manager.spawn_research(2, &coord(), None);
        let failing = manager.register(Arc::new(FailingAgent {
            profile: AgentProfile {
                agent_id: "failing_1".into(),
                persona: "unreliable".into(),
                role: "researcher".into(),
                coordinate: coord(),
                created_at: Utc::now(),
            },
        }));
        ids.push(failing);
        let team = manager.create_team(&ids, None);
        let report = manager
            .run_team(&team, &JsonMap::new(), &JsonMap::new())
            .await
            .unwrap();
        assert_eq!(report.agent_reports.len(), 2);
        assert_eq!(report.consensus.agent_count, 2);
    }

    #[tokio::test]
    async fn deactivated_agents_are_skipped() {
        let manager = AgentManager::new();
        let ids = manager.spawn_research(2, &coord(), None);
        let team = manager.create_team(&ids, None);
        manager.deactivate(&ids[0]);
        let report = manager
            .run_team(&team, &JsonMap::new(), &JsonMap::new())
            .await
            .unwrap();
        assert_eq!(report.agent_reports.len(), 1);
    }

    #[tokio::test]
    async fn unknown_team_errors() {
        let manager = AgentManager::new();
        let err = manager
            .run_team("ghost", &JsonMap::new(), &JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TeamNotFound { .. }));
    }

    #[test]
    fn cleanup_removes_inactive_and_prunes_teams() {
        let manager = AgentManager::new();
        let ids = manager.spawn_research(3, &coord(), None);
        let team = manager.create_team(&ids, Some("t"));
        manager.deactivate(&ids[1]);
        assert_eq!(manager.cleanup_inactive(), 1);
        let stats = manager.stats();
        assert_eq!(stats.total_agents, 2);
        let inner_team: Vec<_> = manager
            .inner
            .read()
            .teams
            .get(&team)
            .cloned()
            .unwrap_or_default();
        assert_eq!(inner_team.len(), 2);
    }

    #[test]
    fn trace_records_lifecycle() {
        let manager = AgentManager::new();
        let ids = manager.spawn_research(1, &coord(), None);
        manager.deactivate(&ids[0]);
        let trace = manager.agent_trace(&ids[0]);
        let events: Vec<_> = trace.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(events, vec!["spawned", "deactivated"]);
    }
}
