//! # Grading Pipeline
//!
//! 扫描试卷阅卷流水线的编排服务
//!
//! ## 架构设计
//!
//! 每个学生依次经过 extract → chunk → map → grade 四个阶段，每个阶段由外部服务完成。
//! 本系统负责排队、认领、重试、统计和运维操作，不做任何业务计算。
//!
//! ### ① 存储层（Store）
//! - `store/` - 作业、学生队列、处理日志、统计的持久化
//! - `MemoryStore` - 单进程内存实现
//! - `PgStore` - Postgres 实现，认领与写回都是条件更新
//!
//! ### ② 业务能力层（Services / Clients）
//! - `services/` - 作业登记、处理日志、统计汇总
//! - `clients/` - 调用外部阶段服务和发现服务
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 单个学生的阶段状态机和退避策略
//! - `StudentCtx` - 日志上下文（作业 + 学号）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/` - 阶段 worker、发现 worker、调度器、监控
//! - `control/` - 对外的操作入口
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod control;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod store;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use control::{ControlResponse, ControlSurface, StartJobRequest};
pub use error::{AppError, AppResult};
pub use models::{JobStatus, PipelineJob, Stage, StudentQueueEntry};
pub use orchestrator::App;
pub use store::{MemoryStore, PgStore, PipelineStore};
pub use workflow::{StudentCtx, Transition};
