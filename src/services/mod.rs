pub mod job_registry;
pub mod metrics;
pub mod processing_log;

pub use job_registry::{JobRegistry, JobSnapshot, ProcessingStudent, StageCounts};
pub use metrics::MetricsAggregator;
pub use processing_log::ProcessingLog;
