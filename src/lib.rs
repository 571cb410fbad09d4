//! # Echelon: Multi-Stage Reasoning Orchestrator
//!
//! Echelon drives a user query through a fixed ladder of up to ten
//! processing stages. Every stage produces a confidence score, optional
//! memory mutations, spawned sub-agents, and alternative branches; the
//! executor decides after each stage whether to complete, escalate to
//! the next stage, or — when the compliance engine says so — contain the
//! run with a hash-stamped certificate.
//!
//! ## Core Concepts
//!
//! - **Stages**: Async units implementing one rung of the reasoning
//!   ladder, committed strictly in stage-number order
//! - **Memory graph**: A process-global, coordinate-indexed store with
//!   patch history and fork lineage, shared by every session
//! - **Compliance**: A rule engine inspecting every stage output, with a
//!   containment latch and certificates
//! - **Hub**: Room-based fan-out of typed lifecycle events to connected
//!   clients
//! - **Audit**: An append-only, canonically hashed event trail
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use echelon::pipeline::{PipelineConfig, PipelineExecutor, SimulationQuery};
//!
//! # async fn example() -> Result<(), echelon::pipeline::PipelineError> {
//! let executor = PipelineExecutor::new(PipelineConfig::from_env());
//! let outcome = executor
//!     .run(SimulationQuery::new("What is 2+2?"), None, None)
//!     .await?;
//! println!("status: {:?}", outcome.session.status);
//! # Ok(())
//! # }
//! ```
//!
//! Synchronous callers at the process boundary can wrap the executor in
//! `tokio::runtime::Runtime::block_on`.
//!
//! ## Module Guide
//!
//! - [`coordinate`] - Thirteen-field coordinates and their hashing
//! - [`memory`] - The shared memory graph
//! - [`audit`] - Audit log and containment certificates
//! - [`compliance`] - Rule engine and containment decisioning
//! - [`plugins`] - Knowledge-algorithm registry and stage dispatch
//! - [`agents`] - Research/perspective agents, teams, consensus
//! - [`stages`] - The stage contract and the ten built-in stages
//! - [`hub`] - Session rooms and typed event broadcast
//! - [`pipeline`] - Sessions, the store, and the executor
//! - [`telemetry`] - Tracing setup

pub mod agents;
pub mod audit;
pub mod compliance;
pub mod coordinate;
pub mod hub;
pub mod memory;
pub mod pipeline;
pub mod plugins;
pub mod stages;
pub mod telemetry;
pub mod utils;
