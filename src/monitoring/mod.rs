pub mod health;
pub mod metrics;

pub use health::{LoopStats, PipelineHealth};
pub use metrics::{Metrics, MetricsSnapshot};
