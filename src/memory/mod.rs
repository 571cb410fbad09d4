//! Coordinate-indexed shared memory with patch history and fork lineage.
//!
//! One [`MemoryGraph`] is shared by every pipeline session in the
//! process; cross-session knowledge accumulation is a feature, not an
//! accident. Cells are keyed by the SHA-256 hash of their coordinate's
//! canonical encoding. Forking a cell supersedes it at the coordinate
//! while the prior cell stays reachable through lineage traversal.

mod cell;
mod graph;

pub use cell::{EntropyEvent, MemoryCell, PatchEvent};
pub use graph::{MemoryGraph, MemoryStats, PatchKind, PatchRecord};
