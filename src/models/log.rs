//! 处理日志：只追加的审计记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::Stage;

/// 日志所属的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    Discovery,
    Stage(Stage),
    Retry,
    Reset,
    Monitor,
    Operator,
}

impl LogStage {
    pub fn label(self) -> &'static str {
        match self {
            LogStage::Discovery => "discovery",
            LogStage::Stage(stage) => stage.name(),
            LogStage::Retry => "retry",
            LogStage::Reset => "reset",
            LogStage::Monitor => "monitor",
            LogStage::Operator => "operator",
        }
    }
}

/// 日志指向的对象
///
/// 条目被删除后仍可通过学号和作业 ID 找到日志。
#[derive(Debug, Clone, PartialEq)]
pub enum LogRef {
    /// 指向队列条目
    Entry {
        id: Uuid,
        job_id: String,
        roll_number: String,
    },
    /// 只知道学号和作业
    Student { job_id: String, roll_number: String },
    /// 作业级日志（如发现阶段）
    Job(String),
}

/// 处理日志条目，写入后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub id: Uuid,
    pub student_entry_id: Option<Uuid>,
    pub job_id: Option<String>,
    pub roll_number: Option<String>,
    pub stage: String,
    pub status: String,
    pub message: String,
    pub duration_seconds: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ProcessingLogEntry {
    pub fn new(
        target: LogRef,
        stage: LogStage,
        status: impl Into<String>,
        message: impl Into<String>,
        duration_seconds: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let (student_entry_id, job_id, roll_number) = match target {
            LogRef::Entry {
                id,
                job_id,
                roll_number,
            } => (Some(id), Some(job_id), Some(roll_number)),
            LogRef::Student {
                job_id,
                roll_number,
            } => (None, Some(job_id), Some(roll_number)),
            LogRef::Job(job_id) => (None, Some(job_id), None),
        };
        Self {
            id: Uuid::new_v4(),
            student_entry_id,
            job_id,
            roll_number,
            stage: stage.label().to_string(),
            status: status.into(),
            message: message.into(),
            duration_seconds,
            timestamp,
        }
    }
}
