//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责 worker 的生命周期和调度，是整个流水线的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用
//! - 选择队列存储，组装各组件
//! - 启动 / 停止 worker 池和监控
//!
//! ### `dispatcher` - 调度器
//! - 持有四个阶段的 worker 池
//! - 启动、重启、存活检查，按阶段唤醒 worker
//!
//! ### `stage_worker` - 阶段 worker
//! - 轮询某阶段的 pending 条目，认领后调用外部服务
//! - 按结果推进、重试或标记失败
//!
//! ### `discovery_worker` - 发现 worker
//! - 每个作业一次，拿到学号名单并建立学生条目
//!
//! ### `monitor` - 监控
//! - 定时重算统计、回收卡死条目、检查 worker 存活
//!
//! ## 层次关系
//!
//! ```text
//! app
//!  ├─ discovery_worker (处理一个作业)
//!  ├─ dispatcher
//!  │    └─ stage_worker × 4 (处理一个学生的一个阶段)
//!  │         ↓
//!  │    workflow::stage_machine (状态转换)
//!  └─ monitor
//!        ↓
//! services (能力层：registry / log / metrics)
//!        ↓
//! store (队列存储)
//! ```
//!
//! ## 设计原则
//!
//! 1. **只通过队列协调**：worker 之间不直接通信，唤醒信号只是提示
//! 2. **向下依赖**：编排层 → workflow → services → store
//! 3. **无业务逻辑**：状态转换规则在 workflow 层

pub mod app;
pub mod discovery_worker;
pub mod dispatcher;
pub mod monitor;
pub mod stage_worker;

// 重新导出主要类型
pub use app::App;
pub use discovery_worker::{sanitize_roll_numbers, DiscoveryWorker};
pub use dispatcher::{Dispatcher, StageSignals};
pub use monitor::{Monitor, MonitorConfig};
pub use stage_worker::{StageWorker, StageWorkerConfig};
