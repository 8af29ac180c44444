//! Run orchestration: a closed set of stages driven to completion.

pub mod cost;
pub mod orchestrator;
pub mod state;

pub use orchestrator::{Pipeline, PipelineError, Services};
pub use state::{CaseContext, CostEstimate, FileContext, RunState, RunStatus, Stage};
