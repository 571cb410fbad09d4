//! Execution context handed to stages.

use std::sync::Arc;

use crate::agents::AgentManager;
use crate::audit::AuditLog;
use crate::coordinate::Coordinate;
use crate::memory::MemoryGraph;
use crate::plugins::dispatch::KaDispatchTable;
use crate::plugins::PluginRegistry;

/// Shared services and run identity visible to a stage.
///
/// Everything a stage touches beyond its input payload goes through this
/// context, which keeps stage side effects explicit and auditable.
#[derive(Clone)]
pub struct StageContext {
    pub memory: Arc<MemoryGraph>,
    pub agents: Arc<AgentManager>,
    pub plugins: Arc<PluginRegistry>,
    pub dispatch: Arc<KaDispatchTable>,
    pub audit: Arc<AuditLog>,
    pub session_id: String,
    pub run_id: String,
    /// Coordinate the query was filed under.
    pub coordinate: Coordinate,
    /// Agent ids the executor attached for this stage (empty unless the
    /// stage profile requires agents).
    pub attached_agents: Vec<String>,
}

impl StageContext {
    #[must_use]
    pub fn with_attached_agents(mut self, agents: Vec<String>) -> Self {
        self.attached_agents = agents;
        self
    }
}
