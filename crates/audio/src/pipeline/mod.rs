//! Pipeline: Quelle -> Stufen -> Senke
//!
//! Aufbau ueber `PipelineBuilder`, Steuerung ueber `Pipeline`
//! (`start`, `pause`, `resume`, `stop`, `wait`).

pub mod builder;
pub mod orchestrator;
pub mod state;

pub use builder::{PipelineBuilder, PipelineConfig, DEFAULT_DRAIN_TIMEOUT};
pub use orchestrator::Pipeline;
pub use state::{PipelineEvent, PipelineOutcome, PipelineState, RetryPolicy};
