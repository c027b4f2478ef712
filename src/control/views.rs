//! 控制接口的返回视图

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    CurrentStage, JobStatus, OverallStatus, PipelineJob, PipelineMetrics, ProcessingLogEntry,
    Stage, StageStatus, StudentQueueEntry,
};
use crate::services::{JobSnapshot, StageCounts};

/// 启动作业的请求
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartJobRequest {
    /// 不填时自动生成
    pub job_id: Option<String>,
    pub question_paper_id: String,
    pub source_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartJobView {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub snapshot: JobSnapshot,
    pub metrics: Option<PipelineMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageView {
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentStatusView {
    pub job_id: String,
    pub roll_number: String,
    pub current_stage: CurrentStage,
    pub overall_status: OverallStatus,
    pub progress_percentage: f64,
    pub stages: Vec<StageView>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub priority: i32,
    pub error_message: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_duration_seconds: Option<f64>,
    pub recent_logs: Vec<ProcessingLogEntry>,
}

impl StudentStatusView {
    pub fn new(entry: &StudentQueueEntry, recent_logs: Vec<ProcessingLogEntry>) -> Self {
        let stages = Stage::ALL
            .into_iter()
            .map(|stage| {
                let record = entry.stage(stage);
                StageView {
                    stage,
                    status: record.status,
                    started_at: record.started_at,
                    completed_at: record.completed_at,
                    duration_seconds: record.duration_secs(),
                }
            })
            .collect();

        Self {
            job_id: entry.job_id.clone(),
            roll_number: entry.roll_number.clone(),
            current_stage: entry.current_stage,
            overall_status: entry.overall_status,
            progress_percentage: entry.progress_percentage(),
            stages,
            retry_count: entry.retry_count,
            max_retries: entry.max_retries,
            priority: entry.priority,
            error_message: entry.error_message.clone(),
            next_attempt_at: entry.next_attempt_at,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            total_duration_seconds: entry.total_duration_secs(),
            recent_logs,
        }
    }
}

/// 作业列表里的一行
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub question_paper_id: String,
    pub status: JobStatus,
    pub total_students: i32,
    pub students_completed: i32,
    pub students_failed: i32,
    pub completion_rate: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&PipelineJob> for JobSummary {
    fn from(job: &PipelineJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            question_paper_id: job.question_paper_id.clone(),
            status: job.status,
            total_students: job.total_students,
            students_completed: job.students_completed,
            students_failed: job.students_failed,
            completion_rate: job.completion_rate(),
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallStats {
    pub total_jobs: usize,
    pub active_jobs: usize,
    /// 已完成作业的学生总数
    pub total_students_processed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolView {
    pub stage: Stage,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub active_jobs: Vec<JobSummary>,
    pub recent_completed: Vec<JobSummary>,
    pub overall: OverallStats,
    pub queue_depth: Vec<(Stage, StageCounts)>,
    pub workers: Vec<WorkerPoolView>,
}

/// 队列里的一个学生
#[derive(Debug, Clone, Serialize)]
pub struct QueuedStudent {
    pub job_id: String,
    pub roll_number: String,
    pub priority: i32,
    pub retry_count: i32,
    /// pending 时为入队时间，processing 时为开始时间
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageQueueView {
    pub stage: Stage,
    pub pending: Vec<QueuedStudent>,
    pub processing: Vec<QueuedStudent>,
}

/// 操作员操作后学生的状态
#[derive(Debug, Clone, Serialize)]
pub struct StudentStateView {
    pub job_id: String,
    pub roll_number: String,
    pub stage: Stage,
    pub current_stage: CurrentStage,
    pub overall_status: OverallStatus,
    pub retry_count: i32,
}

impl StudentStateView {
    pub fn new(entry: &StudentQueueEntry, stage: Stage) -> Self {
        Self {
            job_id: entry.job_id.clone(),
            roll_number: entry.roll_number.clone(),
            stage,
            current_stage: entry.current_stage,
            overall_status: entry.overall_status,
            retry_count: entry.retry_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkResetView {
    pub reset: usize,
    pub students: Vec<StudentStateView>,
    /// 重置失败的学生及原因
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartView {
    pub restarted: Vec<Stage>,
    pub message: String,
}
