pub mod job;
pub mod log;
pub mod metrics;
pub mod stage;
pub mod student;

pub use job::{JobStatus, PipelineJob};
pub use log::{LogRef, LogStage, ProcessingLogEntry};
pub use metrics::PipelineMetrics;
pub use stage::{CurrentStage, OverallStatus, Stage, StageStatus};
pub use student::{StageRecord, StudentQueueEntry};
