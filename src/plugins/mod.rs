//! Knowledge-algorithm (KA) registry with hot reload and crash isolation.
//!
//! A KA is an opaque named runner a stage can dispatch work to. The
//! registry is rebuilt wholesale on [`PluginRegistry::reload`], so
//! callers must resolve runners by name at every dispatch — holding a
//! runner across a reload observes stale behavior by design.
//!
//! Dispatch never propagates a KA failure: a missing name, a runner
//! error, or a runner panic all collapse into the canned failure output
//! (`output: null, confidence: 0, entropy: 1`).

pub mod builtin;
pub mod dispatch;

use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{AuditEventType, AuditLog};
use crate::utils::{json_map, JsonMap};

/// Errors surfaced while registering knowledge algorithms.
#[derive(Debug, Error, Diagnostic)]
pub enum PluginError {
    /// A factory could not produce its registration.
    #[error("knowledge algorithm registration failed: {message}")]
    #[diagnostic(code(echelon::plugins::registration))]
    Registration { message: String },

    /// A runner reported a failure for a well-formed invocation.
    #[error("knowledge algorithm '{name}' failed: {message}")]
    #[diagnostic(code(echelon::plugins::runner))]
    Runner { name: String, message: String },
}

/// Result contract every KA honors.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KaOutput {
    pub output: Value,
    pub confidence: f64,
    pub entropy: f64,
    pub trace: Value,
}

impl KaOutput {
    /// The canned failure result: never raised, always returned.
    pub fn crashed(name: &str, message: &str) -> Self {
        Self {
            output: Value::Null,
            confidence: 0.0,
            entropy: 1.0,
            trace: Value::String(format!("{name} crashed: {message}")),
        }
    }

    /// Whether this output represents a usable (non-canned) result.
    pub fn is_usable(&self) -> bool {
        !self.output.is_null()
    }
}

/// Executable body of a knowledge algorithm.
///
/// Runners are synchronous; the registry executes them on a blocking
/// task so a panicking runner is absorbed rather than unwinding into the
/// pipeline.
pub trait KaRunner: Send + Sync {
    fn run(&self, slice_input: &JsonMap, context: &JsonMap) -> Result<KaOutput, PluginError>;
}

impl<F> KaRunner for F
where
    F: Fn(&JsonMap, &JsonMap) -> Result<KaOutput, PluginError> + Send + Sync,
{
    fn run(&self, slice_input: &JsonMap, context: &JsonMap) -> Result<KaOutput, PluginError> {
        self(slice_input, context)
    }
}

/// What a factory contributes to the registry.
pub struct KaRegistration {
    pub name: String,
    pub meta: JsonMap,
    pub runner: Arc<dyn KaRunner>,
}

impl KaRegistration {
    pub fn new(name: impl Into<String>, meta: JsonMap, runner: Arc<dyn KaRunner>) -> Self {
        Self {
            name: name.into(),
            meta,
            runner,
        }
    }
}

/// Registration entry point; the Rust rendition of a plugin module's
/// `register` hook. Factories that fail are logged and skipped without
/// aborting the registry.
pub trait KaFactory: Send + Sync {
    fn register(&self) -> Result<KaRegistration, PluginError>;
}

impl<F> KaFactory for F
where
    F: Fn() -> Result<KaRegistration, PluginError> + Send + Sync,
{
    fn register(&self) -> Result<KaRegistration, PluginError> {
        self()
    }
}

#[derive(Clone)]
struct KaEntry {
    meta: JsonMap,
    runner: Arc<dyn KaRunner>,
}

/// Name-keyed KA table rebuilt on every load.
pub struct PluginRegistry {
    audit: Arc<AuditLog>,
    factories: Mutex<Vec<Arc<dyn KaFactory>>>,
    table: Mutex<FxHashMap<String, KaEntry>>,
}

impl PluginRegistry {
    /// Empty registry; call [`register_factory`](Self::register_factory)
    /// then [`load`](Self::load).
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            audit,
            factories: Mutex::new(Vec::new()),
            table: Mutex::new(FxHashMap::default()),
        }
    }

    /// Registry preloaded with the builtin algorithms.
    pub fn with_builtins(audit: Arc<AuditLog>) -> Self {
        let registry = Self::new(audit);
        for factory in builtin::default_factories() {
            registry.register_factory(factory);
        }
        registry.load();
        registry
    }

    /// Add a registration hook. Takes effect at the next load/reload.
    pub fn register_factory(&self, factory: Arc<dyn KaFactory>) {
        self.factories.lock().push(factory);
    }

    /// Drop every registration hook. Takes effect at the next reload.
    pub fn clear_factories(&self) {
        self.factories.lock().clear();
    }

    /// Build the name table from scratch by invoking every factory.
    pub fn load(&self) {
        let factories = self.factories.lock().clone();
        let mut fresh: FxHashMap<String, KaEntry> = FxHashMap::default();
        for factory in factories {
            match factory.register() {
                Ok(registration) => {
                    info!(ka = %registration.name, "registered knowledge algorithm");
                    fresh.insert(
                        registration.name,
                        KaEntry {
                            meta: registration.meta,
                            runner: registration.runner,
                        },
                    );
                }
                Err(err) => {
                    // A broken plugin never aborts the registry.
                    warn!(%err, "skipping knowledge algorithm registration");
                }
            }
        }
        *self.table.lock() = fresh;
    }

    /// Rebuild the table, invalidating every previously resolved runner.
    pub fn reload(&self) {
        info!("reloading knowledge algorithms");
        self.load();
    }

    /// Registered KA names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Metadata for a KA, if registered.
    pub fn meta(&self, name: &str) -> Option<JsonMap> {
        self.table.lock().get(name).map(|e| e.meta.clone())
    }

    /// Dispatch a KA by name.
    ///
    /// The runner is resolved under the lock, released, then executed on
    /// a blocking task. Every failure mode — unknown name, runner error,
    /// runner panic — returns the canned failure output.
    pub async fn call(
        &self,
        name: &str,
        slice_input: &JsonMap,
        context: &JsonMap,
    ) -> KaOutput {
        let runner = self.table.lock().get(name).map(|e| Arc::clone(&e.runner));
        let Some(runner) = runner else {
            return KaOutput::crashed(name, "not registered");
        };

        self.audit
            .entry(
                AuditEventType::KaExecutionStart,
                json_map([("ka", json!(name))]),
            )
            .append();

        let input = slice_input.clone();
        let ctx = context.clone();
        let joined =
            tokio::task::spawn_blocking(move || runner.run(&input, &ctx)).await;

        let (output, event) = match joined {
            Ok(Ok(output)) => (output, AuditEventType::KaExecutionSuccess),
            Ok(Err(err)) => (
                KaOutput::crashed(name, &err.to_string()),
                AuditEventType::KaExecutionFailure,
            ),
            Err(join_err) => {
                warn!(ka = name, %join_err, "knowledge algorithm crashed");
                (
                    KaOutput::crashed(name, &join_err.to_string()),
                    AuditEventType::KaExecutionFailure,
                )
            }
        };

        self.audit
            .entry(
                event,
                json_map([
                    ("ka", json!(name)),
                    ("confidence", json!(output.confidence)),
                    ("entropy", json!(output.entropy)),
                ]),
            )
            .append();
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;

    fn echo_registration(name: &'static str, confidence: f64) -> KaRegistration {
        KaRegistration::new(
            name,
            json_map([("version", json!("1.0"))]),
            Arc::new(move |slice: &JsonMap, _ctx: &JsonMap| {
                Ok(KaOutput {
                    output: Value::Object(slice.clone()),
                    confidence,
                    entropy: 0.05,
                    trace: json!("echoed"),
                })
            }),
        )
    }

    #[tokio::test]
    async fn registered_ka_dispatches() {
        let registry = PluginRegistry::new(Arc::new(AuditLog::default()));
        registry.register_factory(Arc::new(|| Ok(echo_registration("echo", 0.75))));
        registry.load();

        assert_eq!(registry.names(), vec!["echo".to_string()]);
        let out = registry
            .call("echo", &json_map([("q", json!("hi"))]), &JsonMap::new())
            .await;
        assert_eq!(out.confidence, 0.75);
        assert_eq!(out.output["q"], "hi");
    }

    #[tokio::test]
    async fn unknown_ka_returns_canned_failure() {
        let registry = PluginRegistry::new(Arc::new(AuditLog::default()));
        let out = registry.call("ghost", &JsonMap::new(), &JsonMap::new()).await;
        assert!(out.output.is_null());
        assert_eq!(out.confidence, 0.0);
        assert_eq!(out.entropy, 1.0);
        assert!(out.trace.as_str().unwrap().contains("ghost crashed"));
    }

    #[tokio::test]
    async fn panicking_runner_is_absorbed() {
        let registry = PluginRegistry::new(Arc::new(AuditLog::default()));
        registry.register_factory(Arc::new(|| {
            Ok(KaRegistration::new(
                "bomb",
                JsonMap::new(),
                Arc::new(|_: &JsonMap, _: &JsonMap| -> Result<KaOutput, PluginError> {
                    panic!("kaboom")
                }),
            ))
        }));
        registry.load();

        let out = registry.call("bomb", &JsonMap::new(), &JsonMap::new()).await;
        assert!(out.output.is_null());
        assert_eq!(out.entropy, 1.0);
        assert!(out.trace.as_str().unwrap().contains("bomb crashed"));
    }

    #[tokio::test]
    async fn failed_registration_is_skipped() {
        let registry = PluginRegistry::new(Arc::new(AuditLog::default()));
        registry.register_factory(Arc::new(|| {
            Err(PluginError::Registration {
                message: "missing manifest".into(),
            })
        }));
        registry.register_factory(Arc::new(|| Ok(echo_registration("ok", 0.9))));
        registry.load();
        assert_eq!(registry.names(), vec!["ok".to_string()]);
        // The broken one dispatches as canned failure.
        let out = registry.call("broken", &JsonMap::new(), &JsonMap::new()).await;
        assert_eq!(out.confidence, 0.0);
    }

    #[tokio::test]
    async fn reload_replaces_the_table() {
        let registry = PluginRegistry::new(Arc::new(AuditLog::default()));
        registry.register_factory(Arc::new(|| Ok(echo_registration("versioned", 0.5))));
        registry.load();
        let before = registry
            .call("versioned", &JsonMap::new(), &JsonMap::new())
            .await;
        assert_eq!(before.confidence, 0.5);

        registry.clear_factories();
        registry.register_factory(Arc::new(|| Ok(echo_registration("versioned", 0.99))));
        registry.reload();

        // Subsequent calls resolve the fresh runner by name.
        let after = registry
            .call("versioned", &JsonMap::new(), &JsonMap::new())
            .await;
        assert_eq!(after.confidence, 0.99);
    }

    #[tokio::test]
    async fn ka_execution_is_audited() {
        let audit = Arc::new(AuditLog::default());
        let registry = PluginRegistry::new(audit.clone());
        registry.register_factory(Arc::new(|| Ok(echo_registration("echo", 0.75))));
        registry.load();
        registry.call("echo", &JsonMap::new(), &JsonMap::new()).await;
        assert_eq!(
            audit
                .query(&AuditFilter::event(AuditEventType::KaExecutionStart), 10, 0)
                .len(),
            1
        );
        assert_eq!(
            audit
                .query(&AuditFilter::event(AuditEventType::KaExecutionSuccess), 10, 0)
                .len(),
            1
        );
    }
}
