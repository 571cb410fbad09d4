//! Shared JSON helpers used across the orchestrator.
//!
//! - [`canonical`] produces the canonical JSON encoding that backs every
//!   audit-entry and certificate hash.
//! - [`json_ext`] provides deep-merge utilities for folding stage outputs.

pub mod canonical;
pub mod json_ext;

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Convenience alias for the free-form JSON object payloads
/// (`details`, `context`, stage outputs) that flow through the pipeline.
pub type JsonMap = serde_json::Map<String, Value>;

/// Build a [`JsonMap`] from an iterator of key/value pairs.
pub fn json_map<I, K>(pairs: I) -> JsonMap
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Fresh `FxHashMap` keyed by `String`, the standard map type for
/// internal indices.
pub fn new_index_map<V>() -> FxHashMap<String, V> {
    FxHashMap::default()
}
