//! 流程层（Workflow）
//!
//! 定义"一个学生"在固定阶段顺序中如何推进：
//! `discovered → extract → chunk → map → grade → done`
//!
//! - `stage_machine` - 纯状态转换，不做 I/O
//! - `backoff` - 瞬时错误后的等待策略
//! - `student_ctx` - 日志上下文

pub mod backoff;
pub mod stage_machine;
pub mod student_ctx;

pub use backoff::BackoffPolicy;
pub use stage_machine::{StageFailure, Transition};
pub use student_ctx::StudentCtx;
