//! 存储层（Store）
//!
//! 学生队列是唯一的共享可变资源，所有协调都通过它完成，不依赖进程内锁，
//! 因此 worker 可以分布在多台机器上。
//!
//! ## 并发约定
//!
//! - 认领：[`StudentQueueRepository::claim_for_processing`] 是一次条件更新，
//!   只有当该阶段仍为 `pending` 时才成功（比较并交换）；返回 `None` 表示
//!   已被别的 worker 抢先认领。
//! - 写回：[`StudentQueueRepository::update_entry`] 比对 `version`，
//!   条目在读出后被他人修改过（监控回收、操作员强制失败）则写回失败。
//! - 计数：[`JobRepository::sync_student_counts`] 在一次原子操作内按条目的实际终态重算，
//!   重复调用或调用被遗漏都能由下一次重算纠正。
//!
//! ## 实现
//!
//! - [`MemoryStore`] - 单进程，测试与本地运行
//! - [`PgStore`] - Postgres，多机部署

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    PipelineJob, PipelineMetrics, ProcessingLogEntry, Stage, StudentQueueEntry,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// 作业表
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 新建作业；`job_id` 已存在时返回 `StoreError::DuplicateJob`
    async fn create_job(&self, job: &PipelineJob) -> AppResult<()>;

    async fn get_job(&self, job_id: &str) -> AppResult<Option<PipelineJob>>;

    /// 全部作业，按创建时间倒序
    async fn list_jobs(&self) -> AppResult<Vec<PipelineJob>>;

    /// 进入 discovering；只允许从 initiated 或尚未建立名单的 failed 进入
    async fn mark_discovering(&self, job_id: &str, now: DateTime<Utc>) -> AppResult<PipelineJob>;

    /// 写入名单并批量建立学生条目，作业经 roster_ready 进入 active
    ///
    /// 名单与条目在同一个原子操作中写入。
    async fn register_roster(
        &self,
        job_id: &str,
        entries: &[StudentQueueEntry],
        now: DateTime<Utc>,
    ) -> AppResult<PipelineJob>;

    /// 作业级失败（发现阶段失败）
    async fn fail_job(&self, job_id: &str, error: &str, now: DateTime<Utc>)
        -> AppResult<PipelineJob>;

    /// 按学生条目的终态重算作业计数，全部结束时作业进入 completed
    ///
    /// 返回重算后的作业，以及作业是否有改动。
    async fn sync_student_counts(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<(PipelineJob, bool)>;
}

/// 学生队列表
#[async_trait]
pub trait StudentQueueRepository: Send + Sync {
    /// 取出某阶段可处理的条目：优先级降序，同优先级先进先出
    async fn find_pending(
        &self,
        stage: Stage,
        limit: usize,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<StudentQueueEntry>>;

    /// `pending → processing` 的比较并交换；`None` 表示没抢到
    async fn claim_for_processing(
        &self,
        entry_id: Uuid,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> AppResult<Option<StudentQueueEntry>>;

    /// 按版本号写回整条记录；成功后 `version` 加一
    ///
    /// 返回 false 表示条目已被他人修改，本次写回被丢弃。
    async fn update_entry(&self, entry: &StudentQueueEntry) -> AppResult<bool>;

    async fn get_entry(&self, job_id: &str, roll_number: &str)
        -> AppResult<Option<StudentQueueEntry>>;

    /// 某作业（或全部作业）的条目
    async fn list_entries(&self, job_id: Option<&str>) -> AppResult<Vec<StudentQueueEntry>>;

    /// 某阶段在 `started_before` 之前开始、仍在 processing 的条目
    async fn find_stuck(
        &self,
        stage: Stage,
        started_before: DateTime<Utc>,
    ) -> AppResult<Vec<StudentQueueEntry>>;
}

/// 处理日志表
#[async_trait]
pub trait ProcessingLogRepository: Send + Sync {
    async fn append_log(&self, entry: &ProcessingLogEntry) -> AppResult<()>;

    /// 某学生最新的日志，时间倒序
    async fn recent_logs(
        &self,
        job_id: &str,
        roll_number: &str,
        limit: usize,
    ) -> AppResult<Vec<ProcessingLogEntry>>;

    /// 删除早于 `cutoff` 的日志，返回删除条数
    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;
}

/// 统计表
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn upsert_metrics(&self, metrics: &PipelineMetrics) -> AppResult<()>;

    async fn get_metrics(&self, job_id: &str) -> AppResult<Option<PipelineMetrics>>;
}

/// 流水线所需的全部存储能力
pub trait PipelineStore:
    JobRepository + StudentQueueRepository + ProcessingLogRepository + MetricsRepository
{
}

impl<T> PipelineStore for T where
    T: JobRepository + StudentQueueRepository + ProcessingLogRepository + MetricsRepository
{
}
