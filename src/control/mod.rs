//! 控制接口（Control Surface）
//!
//! 对外的操作入口：启动作业、查询状态、重试、重启 worker。
//!
//! 所有操作都返回结构化的 [`ControlResponse`]，内部错误不会穿透到调用方：
//! "找不到"、"当前状态不允许"、"成功"和"内部错误"四种结果之一。

pub mod views;

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, PipelineError, StoreError};
use crate::models::{
    JobStatus, LogRef, LogStage, OverallStatus, Stage, StageStatus, StudentQueueEntry,
};
use crate::orchestrator::{Dispatcher, DiscoveryWorker};
use crate::services::{JobRegistry, MetricsAggregator, ProcessingLog, StageCounts};
use crate::store::{PipelineStore, StudentQueueRepository};
use crate::utils::time::now;
use crate::workflow::{stage_machine, StudentCtx};

pub use views::*;

/// 学生状态里附带的最近日志条数
const RECENT_LOG_LIMIT: usize = 10;
/// 仪表盘显示的最近完成作业数
const RECENT_COMPLETED_LIMIT: usize = 5;

/// 控制接口的统一返回
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse<T> {
    Success { data: T },
    NotFound { message: String },
    InvalidState { message: String },
    Error { message: String },
}

impl<T> ControlResponse<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ControlResponse::Success { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            ControlResponse::Success { data } => Some(data),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            ControlResponse::Success { data } => Some(data),
            _ => None,
        }
    }
}

impl<T> From<AppResult<T>> for ControlResponse<T> {
    fn from(result: AppResult<T>) -> Self {
        match result {
            Ok(data) => ControlResponse::Success { data },
            Err(e) => {
                let message = e.to_string();
                match e {
                    AppError::Store(StoreError::NotFound { .. }) => {
                        ControlResponse::NotFound { message }
                    }
                    AppError::Store(StoreError::DuplicateJob { .. })
                    | AppError::Store(StoreError::DuplicateStudent { .. })
                    | AppError::Pipeline(_) => ControlResponse::InvalidState { message },
                    _ => {
                        error!("❌ 控制操作内部错误: {}", message);
                        ControlResponse::Error { message }
                    }
                }
            }
        }
    }
}

/// 控制接口
#[derive(Clone)]
pub struct ControlSurface {
    store: Arc<dyn PipelineStore>,
    registry: JobRegistry,
    log: ProcessingLog,
    metrics: MetricsAggregator,
    dispatcher: Arc<Dispatcher>,
    discovery: Arc<DiscoveryWorker>,
}

impl ControlSurface {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        registry: JobRegistry,
        log: ProcessingLog,
        metrics: MetricsAggregator,
        dispatcher: Arc<Dispatcher>,
        discovery: Arc<DiscoveryWorker>,
    ) -> Self {
        Self {
            store,
            registry,
            log,
            metrics,
            dispatcher,
            discovery,
        }
    }

    // ========== 作业 ==========

    /// 启动作业：建作业并在后台运行发现
    ///
    /// `job_id` 已存在时返回"状态不允许"；例外是发现失败、尚无名单的作业，
    /// 此时重新运行发现。
    pub async fn start_job(&self, request: StartJobRequest) -> ControlResponse<StartJobView> {
        self.start_job_inner(request).await.into()
    }

    async fn start_job_inner(&self, request: StartJobRequest) -> AppResult<StartJobView> {
        if request.question_paper_id.trim().is_empty() {
            return Err(AppError::invalid_state("question_paper_id 不能为空"));
        }
        let job_id = request
            .job_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_job_id);

        self.dispatcher.ensure_workers_running().await;
        let status = match self.registry.get_job(&job_id).await {
            Ok(existing) if existing.status == JobStatus::Failed && existing.total_students == 0 => {
                info!("🔁 作业 {} 重新运行发现", job_id);
                let job = self.registry.begin_discovery(&job_id).await?;
                let status = job.status;
                self.discovery.clone().spawn_discovering(job);
                status
            }
            Ok(_) => {
                return Err(StoreError::DuplicateJob {
                    job_id: job_id.clone(),
                }
                .into())
            }
            Err(e) if e.is_not_found() => {
                let job = self
                    .registry
                    .create_job(&job_id, request.question_paper_id.trim(), request.source_ref)
                    .await?;
                self.discovery.clone().spawn(job_id.clone());
                job.status
            }
            Err(e) => return Err(e),
        };

        Ok(StartJobView { job_id, status })
    }

    /// 作业状态：名单、各阶段计数、正在处理的学生
    pub async fn job_status(&self, job_id: &str) -> ControlResponse<JobStatusView> {
        let result: AppResult<JobStatusView> = async {
            let snapshot = self.registry.get_job_status(job_id).await?;
            let metrics = self.metrics.get(job_id).await?;
            Ok(JobStatusView { snapshot, metrics })
        }
        .await;
        result.into()
    }

    /// 学生状态：阶段明细、重试信息和最近的日志
    pub async fn student_status(
        &self,
        job_id: &str,
        roll_number: &str,
    ) -> ControlResponse<StudentStatusView> {
        let result: AppResult<StudentStatusView> = async {
            let entry = self.find_entry(job_id, roll_number).await?;
            let logs = self.log.recent(job_id, roll_number, RECENT_LOG_LIMIT).await?;
            Ok(StudentStatusView::new(&entry, logs))
        }
        .await;
        result.into()
    }

    // ========== 总览 ==========

    /// 仪表盘：进行中的作业、最近完成的作业、全局各阶段队列深度
    pub async fn dashboard(&self) -> ControlResponse<DashboardView> {
        self.dashboard_inner().await.into()
    }

    async fn dashboard_inner(&self) -> AppResult<DashboardView> {
        let jobs = self.registry.list_jobs().await?;
        let entries = self.store.list_entries(None).await?;

        let active_jobs: Vec<JobSummary> = jobs
            .iter()
            .filter(|job| !job.status.is_terminal())
            .map(JobSummary::from)
            .collect();

        let mut completed: Vec<_> = jobs
            .iter()
            .filter(|job| job.status == JobStatus::Completed)
            .collect();
        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));

        let overall = OverallStats {
            total_jobs: jobs.len(),
            active_jobs: active_jobs.len(),
            total_students_processed: completed.iter().map(|j| j.total_students as i64).sum(),
        };

        let recent_completed = completed
            .into_iter()
            .take(RECENT_COMPLETED_LIMIT)
            .map(JobSummary::from)
            .collect();

        let queue_depth = Stage::ALL
            .into_iter()
            .map(|stage| (stage, StageCounts::tally(stage, &entries)))
            .collect();

        let workers = self
            .dispatcher
            .pool_states()
            .await
            .into_iter()
            .map(|(stage, running)| WorkerPoolView { stage, running })
            .collect();

        Ok(DashboardView {
            active_jobs,
            recent_completed,
            overall,
            queue_depth,
            workers,
        })
    }

    /// 各阶段 pending / processing 的学生
    pub async fn queue_status(&self) -> ControlResponse<Vec<StageQueueView>> {
        let result: AppResult<Vec<StageQueueView>> = async {
            let entries = self.store.list_entries(None).await?;
            Ok(Stage::ALL
                .into_iter()
                .map(|stage| stage_queue(stage, &entries))
                .collect())
        }
        .await;
        result.into()
    }

    // ========== 操作员 ==========

    /// 重试一个失败的学生：只把失败的阶段放回 pending
    pub async fn retry_student(
        &self,
        job_id: &str,
        roll_number: &str,
    ) -> ControlResponse<StudentStateView> {
        let result: AppResult<StudentStateView> = async {
            let entry = self.find_entry(job_id, roll_number).await?;
            self.reset_one(entry).await
        }
        .await;
        result.into()
    }

    /// 批量重试：某作业或全部作业的失败学生
    pub async fn reset_failed_students(&self, job_id: Option<&str>) -> ControlResponse<BulkResetView> {
        let result: AppResult<BulkResetView> = async {
            let failed: Vec<StudentQueueEntry> = self
                .store
                .list_entries(job_id)
                .await?
                .into_iter()
                .filter(|e| e.overall_status == OverallStatus::Failed)
                .collect();

            let mut students = Vec::new();
            let mut skipped = Vec::new();
            for entry in failed {
                let label = format!("{}/{}", entry.job_id, entry.roll_number);
                match self.reset_one(entry).await {
                    Ok(view) => students.push(view),
                    Err(e) => {
                        warn!("⚠️ 重置 {} 失败: {}", label, e);
                        skipped.push((label, e.to_string()));
                    }
                }
            }
            info!(
                "🔁 批量重试 ({}): 重置 {} 名学生",
                job_id.unwrap_or("全部作业"),
                students.len()
            );
            Ok(BulkResetView {
                reset: students.len(),
                students,
                skipped,
            })
        }
        .await;
        result.into()
    }

    /// 强制失败：停止对该学生的自动重试
    pub async fn fail_student(
        &self,
        job_id: &str,
        roll_number: &str,
        reason: &str,
    ) -> ControlResponse<StudentStateView> {
        let result: AppResult<StudentStateView> = async {
            let mut entry = self.find_entry(job_id, roll_number).await?;
            let ctx = StudentCtx::from(&entry);
            let reason = if reason.trim().is_empty() {
                "操作员强制失败"
            } else {
                reason
            };
            let stage = stage_machine::force_fail(&mut entry, reason, now())?;
            if !self.store.update_entry(&entry).await? {
                return Err(AppError::invalid_state("条目刚被修改，请重试"));
            }
            self.registry.sync_counts(job_id).await?;
            self.log
                .append(log_ref(&entry), LogStage::Operator, "failed", reason, None)
                .await;
            warn!("{} ⛔ 操作员在 {} 阶段强制失败: {}", ctx, stage, reason);
            Ok(StudentStateView::new(&entry, stage))
        }
        .await;
        result.into()
    }

    /// 重启所有阶段的 worker 池
    pub async fn restart_workers(&self) -> ControlResponse<RestartView> {
        let restarted = self.dispatcher.restart_workers().await;
        info!("🔄 worker 池已重启: {:?}", restarted);
        ControlResponse::Success {
            data: RestartView {
                message: format!("已重启 {} 个 worker 池", restarted.len()),
                restarted,
            },
        }
    }

    // ========== 内部 ==========

    async fn find_entry(&self, job_id: &str, roll_number: &str) -> AppResult<StudentQueueEntry> {
        self.store
            .get_entry(job_id, roll_number)
            .await?
            .ok_or_else(|| AppError::not_found(format!("作业 {} 学号 {}", job_id, roll_number)))
    }

    async fn reset_one(&self, mut entry: StudentQueueEntry) -> AppResult<StudentStateView> {
        let ctx = StudentCtx::from(&entry);
        let stage = stage_machine::reset_failed(&mut entry, now())?;
        if !self.store.update_entry(&entry).await? {
            return Err(PipelineError::InvalidState(format!("{} 条目刚被修改，请重试", ctx)).into());
        }
        // 计数由条目重算：worker 若在此之前已跑完这个学生，重算同样得到正确结果
        self.registry.sync_counts(&entry.job_id).await?;
        self.log
            .append(
                log_ref(&entry),
                LogStage::Reset,
                "pending",
                format!("操作员重试，{} 重新排队", stage),
                None,
            )
            .await;
        self.dispatcher.trigger(stage);
        info!("{} 🔁 {} 已重新排队", ctx, stage);
        Ok(StudentStateView::new(&entry, stage))
    }
}

fn generate_job_id() -> String {
    format!("job_{}", &Uuid::new_v4().simple().to_string()[..8])
}

fn log_ref(entry: &StudentQueueEntry) -> LogRef {
    LogRef::Entry {
        id: entry.id,
        job_id: entry.job_id.clone(),
        roll_number: entry.roll_number.clone(),
    }
}

fn stage_queue(stage: Stage, entries: &[StudentQueueEntry]) -> StageQueueView {
    let queued = |entry: &StudentQueueEntry, since| QueuedStudent {
        job_id: entry.job_id.clone(),
        roll_number: entry.roll_number.clone(),
        priority: entry.priority,
        retry_count: entry.retry_count,
        since,
    };

    let mut pending = Vec::new();
    let mut processing = Vec::new();
    for entry in entries {
        match entry.status(stage) {
            StageStatus::Pending if !entry.is_terminal() => {
                pending.push(queued(entry, Some(entry.created_at)))
            }
            StageStatus::Processing => {
                processing.push(queued(entry, entry.stage(stage).started_at))
            }
            _ => {}
        }
    }
    StageQueueView {
        stage,
        pending,
        processing,
    }
}
