// src/pipeline/mod.rs

pub mod event_bus;
pub mod frame_context;
pub mod metrics;
pub mod runner;
pub mod session;
pub mod stats;

pub use event_bus::{EventBus, PipelineEvent};
pub use frame_context::{FrameReport, PersonReport};
pub use metrics::{MetricsSummary, PipelineMetrics};
pub use runner::{RunnerCommand, RunnerState, SessionRunner};
pub use session::{PipelineSession, SessionComponents, StepOutcome};
pub use stats::{SessionAggregator, SessionStats};
