pub mod config;
pub mod ingest;
pub mod metrics;
pub mod pipeline;

pub use config::{ConfigError, IngestConfig};
pub use pipeline::{Pipeline, PipelineError, RunState, RunStatus, Services};
