//! Stage-to-KA mapping with per-KA priority and dispatch policies.
//!
//! The pipeline consults this table — not the registry — to decide which
//! knowledge algorithms a stage may invoke and in what order.

use futures_util::future::join_all;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::plugins::{KaOutput, PluginRegistry};
use crate::utils::JsonMap;

/// How a stage's bound KAs are executed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Try bindings from highest priority down, accept the first usable
    /// output.
    PriorityOrder,
    /// Execute every binding concurrently; the stage aggregates.
    ParallelFanout,
}

/// One KA bound to a stage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KaBinding {
    pub name: String,
    pub priority: u8,
}

/// Mutable stage → KA binding table.
pub struct KaDispatchTable {
    bindings: RwLock<FxHashMap<u8, Vec<KaBinding>>>,
}

impl Default for KaDispatchTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl KaDispatchTable {
    pub fn empty() -> Self {
        Self {
            bindings: RwLock::new(FxHashMap::default()),
        }
    }

    /// Table pre-wired for the builtin algorithms.
    pub fn with_defaults() -> Self {
        let table = Self::empty();
        table.bind(1, "query_analyzer", 10);
        table.bind(1, "echo", 1);
        table.bind(2, "echo", 1);
        table.bind(5, "echo", 1);
        table.bind(6, "query_analyzer", 5);
        table.bind(6, "echo", 1);
        table.bind(8, "risk_screen", 10);
        table.bind(10, "risk_screen", 5);
        table
    }

    /// Bind a KA to a stage at the given priority.
    pub fn bind(&self, stage: u8, name: impl Into<String>, priority: u8) {
        let mut bindings = self.bindings.write();
        let list = bindings.entry(stage).or_default();
        list.push(KaBinding {
            name: name.into(),
            priority,
        });
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Remove a binding. Returns whether anything was removed.
    pub fn unbind(&self, stage: u8, name: &str) -> bool {
        let mut bindings = self.bindings.write();
        let Some(list) = bindings.get_mut(&stage) else {
            return false;
        };
        let before = list.len();
        list.retain(|b| b.name != name);
        list.len() != before
    }

    /// Bindings for a stage, highest priority first.
    pub fn bindings_for(&self, stage: u8) -> Vec<KaBinding> {
        self.bindings.read().get(&stage).cloned().unwrap_or_default()
    }

    /// Dispatch the stage's KAs against the registry.
    ///
    /// `PriorityOrder` returns at most one output (the first usable one);
    /// `ParallelFanout` returns one output per binding, canned failures
    /// included, for the stage to aggregate.
    pub async fn dispatch(
        &self,
        registry: &PluginRegistry,
        stage: u8,
        policy: DispatchPolicy,
        slice_input: &JsonMap,
        context: &JsonMap,
    ) -> Vec<KaOutput> {
        let bindings = self.bindings_for(stage);
        if bindings.is_empty() {
            return Vec::new();
        }
        match policy {
            DispatchPolicy::PriorityOrder => {
                for binding in &bindings {
                    let output = registry.call(&binding.name, slice_input, context).await;
                    if output.is_usable() {
                        return vec![output];
                    }
                }
                Vec::new()
            }
            DispatchPolicy::ParallelFanout => {
                join_all(
                    bindings
                        .iter()
                        .map(|b| registry.call(&b.name, slice_input, context)),
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::plugins::{KaRegistration, PluginError};
    use crate::utils::json_map;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn registry_with(names: &[(&'static str, f64)]) -> PluginRegistry {
        let registry = PluginRegistry::new(Arc::new(AuditLog::default()));
        for (name, confidence) in names.iter().copied() {
            registry.register_factory(Arc::new(move || {
                Ok(KaRegistration::new(
                    name,
                    Default::default(),
                    Arc::new(
                        move |_: &crate::utils::JsonMap, _: &crate::utils::JsonMap| {
                            if confidence == 0.0 {
                                Err(PluginError::Runner {
                                    name: name.to_string(),
                                    message: "unavailable".into(),
                                })
                            } else {
                                Ok(KaOutput {
                                    output: json!({"by": name}),
                                    confidence,
                                    entropy: 0.1,
                                    trace: Value::Null,
                                })
                            }
                        },
                    ),
                ))
            }));
        }
        registry.load();
        registry
    }

    #[test]
    fn bindings_sort_by_priority() {
        let table = KaDispatchTable::empty();
        table.bind(3, "low", 1);
        table.bind(3, "high", 9);
        table.bind(3, "mid", 5);
        let names: Vec<_> = table.bindings_for(3).into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn priority_order_takes_first_usable() {
        let registry = registry_with(&[("primary", 0.0), ("fallback", 0.8)]);
        let table = KaDispatchTable::empty();
        table.bind(4, "primary", 10);
        table.bind(4, "fallback", 1);
        let outputs = table
            .dispatch(
                &registry,
                4,
                DispatchPolicy::PriorityOrder,
                &JsonMap::new(),
                &JsonMap::new(),
            )
            .await;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].output["by"], "fallback");
    }

    #[tokio::test]
    async fn parallel_fanout_returns_everything() {
        let registry = registry_with(&[("a", 0.6), ("b", 0.7), ("c", 0.0)]);
        let table = KaDispatchTable::empty();
        for name in ["a", "b", "c"] {
            table.bind(7, name, 1);
        }
        let outputs = table
            .dispatch(
                &registry,
                7,
                DispatchPolicy::ParallelFanout,
                &json_map([("q", json!("x"))]),
                &JsonMap::new(),
            )
            .await;
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs.iter().filter(|o| o.is_usable()).count(), 2);
    }

    #[tokio::test]
    async fn unbound_stage_dispatches_nothing() {
        let registry = registry_with(&[("a", 0.6)]);
        let table = KaDispatchTable::empty();
        let outputs = table
            .dispatch(
                &registry,
                9,
                DispatchPolicy::PriorityOrder,
                &JsonMap::new(),
                &JsonMap::new(),
            )
            .await;
        assert!(outputs.is_empty());
    }

    #[test]
    fn unbind_removes_binding() {
        let table = KaDispatchTable::with_defaults();
        assert!(table.unbind(1, "echo"));
        assert!(!table.unbind(1, "echo"));
        let names: Vec<_> = table.bindings_for(1).into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["query_analyzer"]);
    }
}
