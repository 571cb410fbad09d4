//! Session model, store, configuration, and the pipeline executor.

mod config;
mod executor;
mod session;
mod store;

pub use config::PipelineConfig;
pub use executor::{PipelineError, PipelineExecutor, RunOutcome};
pub use session::{
    ConfidenceScore, Session, SessionStatus, SimulationQuery, StageState, StageStatus,
    TraceEventKind, TraceStep,
};
pub use store::SessionStore;
