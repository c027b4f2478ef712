//! 流水线作业：每次阅卷运行一条

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// 作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Initiated,
    Discovering,
    RosterReady,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Initiated => "initiated",
            JobStatus::Discovering => "discovering",
            JobStatus::RosterReady => "roster_ready",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(JobStatus::Initiated),
            "discovering" => Ok(JobStatus::Discovering),
            "roster_ready" => Ok(JobStatus::RosterReady),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(StoreError::Corrupt {
                column: "status".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// 流水线作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub job_id: String,
    pub question_paper_id: String,
    /// 扫描件来源（路径或对象存储键）
    pub source_ref: Option<String>,
    pub status: JobStatus,

    /// 发现的学号，保持发现顺序
    pub discovered_roll_numbers: Vec<String>,
    pub total_students: i32,
    pub students_completed: i32,
    pub students_failed: i32,

    pub created_at: DateTime<Utc>,
    pub discovery_started_at: Option<DateTime<Utc>>,
    pub discovery_completed_at: Option<DateTime<Utc>>,
    pub pipeline_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    pub error_message: Option<String>,
}

impl PipelineJob {
    pub fn new(
        job_id: impl Into<String>,
        question_paper_id: impl Into<String>,
        source_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            question_paper_id: question_paper_id.into(),
            source_ref,
            status: JobStatus::Initiated,
            discovered_roll_numbers: Vec::new(),
            total_students: 0,
            students_completed: 0,
            students_failed: 0,
            created_at: now,
            discovery_started_at: None,
            discovery_completed_at: None,
            pipeline_started_at: None,
            completed_at: None,
            updated_at: now,
            error_message: None,
        }
    }

    /// 完成率（百分比，一位小数）
    pub fn completion_rate(&self) -> f64 {
        if self.total_students > 0 {
            (self.students_completed as f64 / self.total_students as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        }
    }

    /// 已到达终态的学生数
    pub fn finished_students(&self) -> i32 {
        self.students_completed + self.students_failed
    }

    /// 是否所有学生都已到达终态
    pub fn roster_finished(&self) -> bool {
        self.total_students > 0 && self.finished_students() >= self.total_students
    }

    /// 用学生条目的实际终态覆盖计数
    ///
    /// 只对 active / completed 作业生效：全部学生结束时进入 completed（部分成功也算完成），
    /// 有学生被重新排队时 completed 回到 active。返回作业是否有改动。
    pub fn sync_counts(&mut self, completed: i32, failed: i32, now: DateTime<Utc>) -> bool {
        if !matches!(self.status, JobStatus::Active | JobStatus::Completed) {
            return false;
        }
        let mut changed = self.students_completed != completed || self.students_failed != failed;
        self.students_completed = completed;
        self.students_failed = failed;

        let finished = self.roster_finished();
        if finished && self.status == JobStatus::Active {
            self.status = JobStatus::Completed;
            self.completed_at = Some(now);
            changed = true;
        } else if !finished && self.status == JobStatus::Completed {
            self.status = JobStatus::Active;
            self.completed_at = None;
            changed = true;
        }
        if changed {
            self.updated_at = now;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_job(total: i32) -> PipelineJob {
        let mut job = PipelineJob::new("job_1", "qp-1", None, Utc::now());
        job.status = JobStatus::Active;
        job.total_students = total;
        job
    }

    #[test]
    fn test_partial_success_completes_job() {
        let mut job = active_job(3);
        let now = Utc::now();
        assert!(job.sync_counts(1, 1, now));
        assert_eq!(job.status, JobStatus::Active);

        assert!(job.sync_counts(2, 1, now));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_at, Some(now));
        assert_eq!(job.completion_rate(), 66.7);

        // 重复同步没有改动
        assert!(!job.sync_counts(2, 1, now));
    }

    #[test]
    fn test_requeued_student_reopens_job() {
        let mut job = active_job(1);
        let now = Utc::now();
        job.sync_counts(0, 1, now);
        assert_eq!(job.status, JobStatus::Completed);

        assert!(job.sync_counts(0, 0, now));
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.students_failed, 0);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_sync_ignores_jobs_without_roster() {
        let mut job = PipelineJob::new("job_1", "qp-1", None, Utc::now());
        job.status = JobStatus::Failed;
        assert!(!job.sync_counts(1, 0, Utc::now()));
        assert_eq!(job.students_completed, 0);
    }
}
