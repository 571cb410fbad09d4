//! The process-global coordinate-indexed memory graph.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::coordinate::Coordinate;
use crate::memory::cell::MemoryCell;
use crate::utils::JsonMap;

/// Kind tag on a global patch-log record.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    /// Cell created or overwritten via `set`.
    Set,
    /// Explicit `patch` mutation.
    Patch,
    Fork,
    Decay,
    Delete,
}

/// One entry in the graph-wide chronological patch log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: PatchKind,
    pub coordinate: String,
    pub cell_id: String,
    /// Superseded cell id, present on fork records.
    pub forked_from: Option<String>,
    pub persona: Option<String>,
    pub meta: JsonMap,
}

/// Aggregate counters reported by [`MemoryGraph::stats`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryStats {
    pub n_cells: usize,
    pub n_personas: usize,
    pub n_forks: usize,
    pub n_patches: usize,
}

#[derive(Default)]
struct GraphInner {
    /// coordinate hash -> live cell
    cells: FxHashMap<String, MemoryCell>,
    /// superseded cells, reachable only by cell id
    archive: FxHashMap<String, MemoryCell>,
    persona_index: FxHashMap<String, FxHashSet<String>>,
    fork_children: FxHashMap<String, FxHashSet<String>>,
    patch_log: Vec<PatchRecord>,
}

/// Concurrency-safe knowledge graph keyed by coordinate hash.
///
/// All operations are externally atomic: every mutation updates the
/// primary map, persona index, and patch log inside one critical section,
/// so a reader never observes a partially mutated cell.
///
/// ```
/// use echelon::coordinate::Coordinate;
/// use echelon::memory::MemoryGraph;
/// use serde_json::json;
///
/// let graph = MemoryGraph::new();
/// let coord = Coordinate::builder("PL09").sector("5415").build().unwrap();
/// graph.set(&coord, json!({"answer": 42}), Default::default(), Some("analyst"));
/// let cell = graph.get(&coord, None).unwrap();
/// assert_eq!(cell.value["answer"], 42);
/// ```
pub struct MemoryGraph {
    inner: RwLock<GraphInner>,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
        }
    }

    /// Live cell at the coordinate.
    ///
    /// With a persona filter, the cell is returned only when its metadata
    /// persona matches.
    pub fn get(&self, coordinate: &Coordinate, persona: Option<&str>) -> Option<MemoryCell> {
        let inner = self.inner.read();
        let cell = inner.cells.get(&coordinate.hash())?;
        match persona {
            Some(p) if cell.persona() != Some(p) => None,
            _ => Some(cell.clone()),
        }
    }

    /// Create the cell at the coordinate, or patch it in place when one
    /// already exists. Updates the persona index from the explicit
    /// persona argument or the metadata's `persona` key.
    pub fn set(
        &self,
        coordinate: &Coordinate,
        value: Value,
        meta: JsonMap,
        persona: Option<&str>,
    ) -> MemoryCell {
        self.mutate(coordinate, value, meta, persona, PatchKind::Set)
    }

    /// Identical to [`set`](Self::set); the global record is tagged as an
    /// explicit patch so audit consumers can distinguish deliberate
    /// mutation from initial writes.
    pub fn patch(
        &self,
        coordinate: &Coordinate,
        value: Value,
        meta: JsonMap,
        persona: Option<&str>,
    ) -> MemoryCell {
        self.mutate(coordinate, value, meta, persona, PatchKind::Patch)
    }

    fn mutate(
        &self,
        coordinate: &Coordinate,
        value: Value,
        meta: JsonMap,
        persona: Option<&str>,
        kind: PatchKind,
    ) -> MemoryCell {
        let key = coordinate.hash();
        let persona_id = persona
            .map(str::to_string)
            .or_else(|| meta.get("persona").and_then(Value::as_str).map(str::to_string));

        let mut inner = self.inner.write();
        let cell = match inner.cells.get_mut(&key) {
            Some(existing) => {
                existing.patch(value, meta.clone(), "edit");
                existing.clone()
            }
            None => {
                let cell = MemoryCell::new(coordinate.clone(), value, meta.clone(), None);
                inner.cells.insert(key.clone(), cell.clone());
                cell
            }
        };
        if let Some(pid) = &persona_id {
            inner
                .persona_index
                .entry(pid.clone())
                .or_default()
                .insert(cell.cell_id.clone());
        }
        inner.patch_log.push(PatchRecord {
            timestamp: Utc::now(),
            kind,
            coordinate: coordinate.encode(),
            cell_id: cell.cell_id.clone(),
            forked_from: None,
            persona: persona_id,
            meta,
        });
        debug!(coordinate = %coordinate, kind = ?kind, "memory cell mutated");
        cell
    }

    /// Fork the cell at the coordinate.
    ///
    /// Returns `None` when no cell lives there. Otherwise the child cell
    /// replaces the live cell; the parent moves to the archive and stays
    /// reachable only via [`cell_by_id`](Self::cell_by_id) and lineage
    /// traversal.
    pub fn fork(
        &self,
        coordinate: &Coordinate,
        new_value: Value,
        meta: JsonMap,
        reason: &str,
    ) -> Option<MemoryCell> {
        let key = coordinate.hash();
        let mut inner = self.inner.write();
        let mut parent = inner.cells.remove(&key)?;
        let child = parent.fork(new_value, meta.clone(), reason);

        inner
            .fork_children
            .entry(parent.cell_id.clone())
            .or_default()
            .insert(child.cell_id.clone());
        if let Some(pid) = child.persona().map(str::to_string) {
            inner
                .persona_index
                .entry(pid)
                .or_default()
                .insert(child.cell_id.clone());
        }
        inner.patch_log.push(PatchRecord {
            timestamp: Utc::now(),
            kind: PatchKind::Fork,
            coordinate: coordinate.encode(),
            cell_id: child.cell_id.clone(),
            forked_from: Some(parent.cell_id.clone()),
            persona: child.persona().map(str::to_string),
            meta,
        });
        inner.archive.insert(parent.cell_id.clone(), parent);
        inner.cells.insert(key, child.clone());
        debug!(coordinate = %coordinate, reason, "memory cell forked");
        Some(child)
    }

    /// Raise the entropy of the cell at the coordinate.
    pub fn decay(&self, coordinate: &Coordinate, delta: f64) {
        let key = coordinate.hash();
        let mut inner = self.inner.write();
        let Some(cell) = inner.cells.get_mut(&key) else {
            return;
        };
        cell.decay(delta);
        let cell_id = cell.cell_id.clone();
        inner.patch_log.push(PatchRecord {
            timestamp: Utc::now(),
            kind: PatchKind::Decay,
            coordinate: coordinate.encode(),
            cell_id,
            forked_from: None,
            persona: None,
            meta: JsonMap::new(),
        });
    }

    /// Remove the live cell at the coordinate.
    ///
    /// Persona-index entries for the cell are dropped and `n_cells`
    /// shrinks; archived ancestors remain reachable by id.
    pub fn delete(&self, coordinate: &Coordinate) -> bool {
        let key = coordinate.hash();
        let mut inner = self.inner.write();
        let Some(cell) = inner.cells.remove(&key) else {
            return false;
        };
        for ids in inner.persona_index.values_mut() {
            ids.remove(&cell.cell_id);
        }
        inner.persona_index.retain(|_, ids| !ids.is_empty());
        inner.patch_log.push(PatchRecord {
            timestamp: Utc::now(),
            kind: PatchKind::Delete,
            coordinate: coordinate.encode(),
            cell_id: cell.cell_id.clone(),
            forked_from: None,
            persona: cell.persona().map(str::to_string),
            meta: JsonMap::new(),
        });
        true
    }

    /// Look a cell up by id, live or archived.
    pub fn cell_by_id(&self, cell_id: &str) -> Option<MemoryCell> {
        let inner = self.inner.read();
        inner
            .cells
            .values()
            .find(|c| c.cell_id == cell_id)
            .or_else(|| inner.archive.get(cell_id))
            .cloned()
    }

    /// All cells indexed under a persona. O(k) in the persona's cell count.
    pub fn find_by_persona(&self, persona: &str) -> Vec<MemoryCell> {
        let inner = self.inner.read();
        let Some(ids) = inner.persona_index.get(persona) else {
            return Vec::new();
        };
        inner
            .cells
            .values()
            .chain(inner.archive.values())
            .filter(|c| ids.contains(&c.cell_id))
            .cloned()
            .collect()
    }

    /// Chronological patch records at or after the timestamp.
    pub fn patch_log_since(&self, since: DateTime<Utc>) -> Vec<PatchRecord> {
        let inner = self.inner.read();
        inner
            .patch_log
            .iter()
            .filter(|p| p.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Every live cell, for inspection and dumps.
    pub fn dump_cells(&self) -> Vec<MemoryCell> {
        self.inner.read().cells.values().cloned().collect()
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.read();
        MemoryStats {
            n_cells: inner.cells.len(),
            n_personas: inner.persona_index.len(),
            n_forks: inner.fork_children.values().map(FxHashSet::len).sum(),
            n_patches: inner.patch_log.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::json_map;
    use chrono::TimeZone;
    use serde_json::json;

    fn coord(sector: &str) -> Coordinate {
        Coordinate::builder("PL09").sector(sector).build().unwrap()
    }

    fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(0, 0).unwrap()
    }

    #[test]
    fn set_then_get_round_trips() {
        let graph = MemoryGraph::new();
        let c = coord("1");
        graph.set(&c, json!("v"), JsonMap::new(), None);
        assert_eq!(graph.get(&c, None).unwrap().value, json!("v"));
        assert_eq!(graph.stats().n_cells, 1);
    }

    #[test]
    fn persona_filter_restricts_get() {
        let graph = MemoryGraph::new();
        let c = coord("2");
        graph.set(&c, json!("v"), json_map([("persona", json!("a"))]), None);
        assert!(graph.get(&c, Some("a")).is_some());
        assert!(graph.get(&c, Some("b")).is_none());
        assert!(graph.get(&c, None).is_some());
    }

    #[test]
    fn set_patches_existing_cell_in_place() {
        let graph = MemoryGraph::new();
        let c = coord("3");
        let first = graph.set(&c, json!("v1"), JsonMap::new(), None);
        let second = graph.set(&c, json!("v2"), JsonMap::new(), None);
        assert_eq!(first.cell_id, second.cell_id);
        assert_eq!(second.patch_history.len(), 1);
        assert_eq!(graph.stats().n_cells, 1);
    }

    #[test]
    fn two_identical_patches_record_two_history_entries() {
        let graph = MemoryGraph::new();
        let c = coord("4");
        graph.set(&c, json!("v0"), JsonMap::new(), None);
        graph.patch(&c, json!("v"), json_map([("m", json!(1))]), None);
        graph.patch(&c, json!("v"), json_map([("m", json!(1))]), None);
        let cell = graph.get(&c, None).unwrap();
        assert_eq!(cell.value, json!("v"));
        assert_eq!(cell.patch_history.len(), 2);
    }

    #[test]
    fn fork_replaces_live_cell_and_preserves_lineage() {
        let graph = MemoryGraph::new();
        let c = coord("5");
        let parent = graph.set(&c, json!("v1"), json_map([("persona", json!("a"))]), None);
        let child = graph
            .fork(&c, json!("v2"), json_map([("persona", json!("b"))]), "r")
            .unwrap();

        let live = graph.get(&c, None).unwrap();
        assert_eq!(live.cell_id, child.cell_id);
        assert_eq!(live.value, json!("v2"));
        assert_eq!(live.parent_cell_id.as_deref(), Some(parent.cell_id.as_str()));
        assert!(live.lineage.contains(&parent.cell_id));

        // Parent reachable only by id now.
        let archived = graph.cell_by_id(&parent.cell_id).unwrap();
        assert_eq!(archived.value, json!("v1"));
        assert_eq!(graph.stats().n_forks, 1);
    }

    #[test]
    fn fork_on_missing_coordinate_returns_none() {
        let graph = MemoryGraph::new();
        assert!(graph.fork(&coord("6"), json!(1), JsonMap::new(), "r").is_none());
    }

    #[test]
    fn patch_log_orders_set_then_fork() {
        let graph = MemoryGraph::new();
        let c = coord("7");
        graph.set(&c, json!("v1"), json_map([("persona", json!("a"))]), None);
        graph.fork(&c, json!("v2"), json_map([("persona", json!("b"))]), "r");
        let log = graph.patch_log_since(epoch());
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].kind, PatchKind::Set);
        assert_eq!(log[1].kind, PatchKind::Fork);
        assert!(log[1].forked_from.is_some());
        assert!(log[0].timestamp <= log[1].timestamp);
    }

    #[test]
    fn find_by_persona_returns_indexed_cells() {
        let graph = MemoryGraph::new();
        graph.set(&coord("8"), json!(1), json_map([("persona", json!("x"))]), None);
        graph.set(&coord("9"), json!(2), JsonMap::new(), Some("x"));
        graph.set(&coord("10"), json!(3), json_map([("persona", json!("y"))]), None);
        assert_eq!(graph.find_by_persona("x").len(), 2);
        assert_eq!(graph.find_by_persona("y").len(), 1);
        assert!(graph.find_by_persona("absent").is_empty());
    }

    #[test]
    fn delete_removes_cell_and_persona_entries() {
        let graph = MemoryGraph::new();
        let c = coord("11");
        graph.set(&c, json!(1), json_map([("persona", json!("p"))]), None);
        assert!(graph.delete(&c));
        assert!(graph.get(&c, None).is_none());
        assert_eq!(graph.stats().n_cells, 0);
        assert!(graph.find_by_persona("p").is_empty());
        assert!(!graph.delete(&c));
    }

    #[test]
    fn stats_count_distinct_coordinates() {
        let graph = MemoryGraph::new();
        graph.set(&coord("20"), json!(1), JsonMap::new(), None);
        graph.set(&coord("20"), json!(2), JsonMap::new(), None);
        graph.set(&coord("21"), json!(3), JsonMap::new(), None);
        let stats = graph.stats();
        assert_eq!(stats.n_cells, 2);
        assert_eq!(stats.n_patches, 3);
    }

    #[test]
    fn stored_key_is_coordinate_hash() {
        let graph = MemoryGraph::new();
        let c = coord("22");
        graph.set(&c, json!(1), JsonMap::new(), None);
        let cell = graph.get(&c, None).unwrap();
        assert_eq!(cell.coordinate.hash(), c.hash());
    }
}
