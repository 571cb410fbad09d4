//! A single memory cell: value, metadata, and its mutation history.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::coordinate::Coordinate;
use crate::utils::JsonMap;

/// One recorded in-place mutation of a cell.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PatchEvent {
    pub timestamp: DateTime<Utc>,
    /// `edit` for ordinary patches, `fork` on the child side of a fork.
    pub kind: String,
    pub old_value: Value,
    pub new_value: Value,
    pub meta: JsonMap,
}

/// One recorded entropy adjustment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EntropyEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub delta: f64,
}

/// A value stored at a coordinate, with lineage and history.
///
/// Invariants upheld by construction:
/// - `cell_id` is derived from the coordinate encoding and the creation
///   timestamp, making it globally unique;
/// - `last_modified >= created_at`;
/// - a fork cell's `parent_cell_id` is present and equals the last entry
///   of its `lineage`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryCell {
    pub coordinate: Coordinate,
    pub value: Value,
    pub meta: JsonMap,
    pub cell_id: String,
    pub parent_cell_id: Option<String>,
    /// Ancestor cell ids, oldest first.
    pub lineage: Vec<String>,
    /// Cell ids forked off this cell.
    pub forks: FxHashSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub patch_history: Vec<PatchEvent>,
    pub entropy_log: Vec<EntropyEvent>,
}

impl MemoryCell {
    pub(crate) fn new(
        coordinate: Coordinate,
        value: Value,
        meta: JsonMap,
        parent_cell_id: Option<String>,
    ) -> Self {
        let created_at = Utc::now();
        let cell_id = derive_cell_id(&coordinate, created_at);
        Self {
            coordinate,
            value,
            meta,
            cell_id,
            parent_cell_id,
            lineage: Vec::new(),
            forks: FxHashSet::default(),
            created_at,
            last_modified: created_at,
            patch_history: Vec::new(),
            entropy_log: Vec::new(),
        }
    }

    /// Mutate the cell in place, merging metadata and recording the edit.
    pub(crate) fn patch(&mut self, new_value: Value, meta: JsonMap, kind: &str) {
        let old_value = std::mem::replace(&mut self.value, new_value.clone());
        for (k, v) in &meta {
            self.meta.insert(k.clone(), v.clone());
        }
        self.patch_history.push(PatchEvent {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            old_value,
            new_value,
            meta,
        });
        self.last_modified = Utc::now();
    }

    /// Produce a child cell superseding this one at the same coordinate.
    ///
    /// The child's lineage extends this cell's lineage by this cell's id,
    /// and this cell records the child among its forks.
    pub(crate) fn fork(&mut self, new_value: Value, mut meta: JsonMap, reason: &str) -> MemoryCell {
        meta.insert("fork_reason".to_string(), Value::String(reason.to_string()));
        let mut child = MemoryCell::new(
            self.coordinate.clone(),
            new_value,
            meta,
            Some(self.cell_id.clone()),
        );
        child.lineage = self.lineage.clone();
        child.lineage.push(self.cell_id.clone());
        self.forks.insert(child.cell_id.clone());
        child
    }

    /// Raise the cell's entropy and log the decay.
    pub(crate) fn decay(&mut self, delta: f64) {
        let current = self
            .meta
            .get("entropy")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        self.meta.insert(
            "entropy".to_string(),
            Value::from(current + delta),
        );
        self.entropy_log.push(EntropyEvent {
            timestamp: Utc::now(),
            kind: "decay".to_string(),
            delta,
        });
        self.last_modified = Utc::now();
    }

    /// Persona recorded in the cell metadata, if any.
    pub fn persona(&self) -> Option<&str> {
        self.meta.get("persona").and_then(Value::as_str)
    }

    /// Current entropy value from metadata, defaulting to zero.
    pub fn entropy(&self) -> f64 {
        self.meta
            .get("entropy")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }
}

fn derive_cell_id(coordinate: &Coordinate, created_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(coordinate.encode().as_bytes());
    hasher.update(b"-");
    hasher.update(
        created_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| created_at.timestamp_micros())
            .to_le_bytes(),
    );
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::json_map;
    use serde_json::json;

    fn coord() -> Coordinate {
        Coordinate::builder("PL05").sector("11").build().unwrap()
    }

    #[test]
    fn patch_records_history_and_merges_meta() {
        let mut cell = MemoryCell::new(coord(), json!("v1"), JsonMap::new(), None);
        cell.patch(json!("v2"), json_map([("source", json!("test"))]), "edit");
        assert_eq!(cell.value, json!("v2"));
        assert_eq!(cell.patch_history.len(), 1);
        assert_eq!(cell.patch_history[0].old_value, json!("v1"));
        assert_eq!(cell.meta.get("source"), Some(&json!("test")));
        assert!(cell.last_modified >= cell.created_at);
    }

    #[test]
    fn fork_wires_lineage_both_ways() {
        let mut parent = MemoryCell::new(coord(), json!("v1"), JsonMap::new(), None);
        let child = parent.fork(json!("v2"), JsonMap::new(), "disagreement");
        assert_eq!(child.parent_cell_id.as_deref(), Some(parent.cell_id.as_str()));
        assert_eq!(child.lineage.last(), Some(&parent.cell_id));
        assert!(parent.forks.contains(&child.cell_id));
        assert_eq!(child.meta.get("fork_reason"), Some(&json!("disagreement")));
        assert_ne!(child.cell_id, parent.cell_id);
    }

    #[test]
    fn decay_accumulates_entropy() {
        let mut cell = MemoryCell::new(coord(), json!(1), JsonMap::new(), None);
        cell.decay(0.1);
        cell.decay(0.25);
        assert!((cell.entropy() - 0.35).abs() < 1e-9);
        assert_eq!(cell.entropy_log.len(), 2);
    }
}
