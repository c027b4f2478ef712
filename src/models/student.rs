//! 学生队列条目：每个 (作业, 学号) 一条状态机记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::{CurrentStage, OverallStatus, Stage, StageStatus};

/// 单个阶段的状态与时间戳
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    fn pending() -> Self {
        Self {
            status: StageStatus::Pending,
            ..Default::default()
        }
    }

    /// 阶段耗时（秒），未完成时为 None
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// 学生队列条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentQueueEntry {
    pub id: Uuid,
    pub job_id: String,
    pub question_paper_id: String,
    pub roll_number: String,

    pub current_stage: CurrentStage,
    pub overall_status: OverallStatus,

    pub extract: StageRecord,
    pub chunk: StageRecord,
    pub map: StageRecord,
    pub grade: StageRecord,

    pub retry_count: i32,
    pub max_retries: i32,
    /// 数字越大越先处理
    pub priority: i32,
    pub error_message: Option<String>,
    /// 退避中的条目在此时间之前不会被取出
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// 每次写入加一，写回时比对，防止覆盖别人的修改
    pub version: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StudentQueueEntry {
    /// 发现阶段创建的新条目：位于 `discovered`，extract 待处理，其余阶段等待
    pub fn new(
        job_id: impl Into<String>,
        question_paper_id: impl Into<String>,
        roll_number: impl Into<String>,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.into(),
            question_paper_id: question_paper_id.into(),
            roll_number: roll_number.into(),
            current_stage: CurrentStage::Discovered,
            overall_status: OverallStatus::Pending,
            extract: StageRecord::pending(),
            chunk: StageRecord::default(),
            map: StageRecord::default(),
            grade: StageRecord::default(),
            retry_count: 0,
            max_retries,
            priority: 0,
            error_message: None,
            next_attempt_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage(&self, stage: Stage) -> &StageRecord {
        match stage {
            Stage::Extract => &self.extract,
            Stage::Chunk => &self.chunk,
            Stage::Map => &self.map,
            Stage::Grade => &self.grade,
        }
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageRecord {
        match stage {
            Stage::Extract => &mut self.extract,
            Stage::Chunk => &mut self.chunk,
            Stage::Map => &mut self.map,
            Stage::Grade => &mut self.grade,
        }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.stage(stage).status
    }

    /// 第一个尚未完成的阶段
    pub fn active_stage(&self) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|s| self.status(*s) != StageStatus::Completed)
    }

    /// 失败所在的阶段
    pub fn failed_stage(&self) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|s| self.status(*s) == StageStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.overall_status.is_terminal()
    }

    /// 是否可以被某个阶段的 worker 取出
    pub fn is_ready_for(&self, stage: Stage, now: DateTime<Utc>) -> bool {
        self.status(stage) == StageStatus::Pending
            && !self.is_terminal()
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// 完成百分比（一位小数）
    pub fn progress_percentage(&self) -> f64 {
        let done = Stage::ALL
            .iter()
            .filter(|s| self.status(**s) == StageStatus::Completed)
            .count();
        (done as f64 / Stage::ALL.len() as f64 * 1000.0).round() / 10.0
    }

    /// 从创建到评分完成的总耗时（秒）
    pub fn total_duration_secs(&self) -> Option<f64> {
        self.grade
            .completed_at
            .map(|end| (end - self.created_at).num_milliseconds() as f64 / 1000.0)
    }

    /// 检查状态机不变式
    ///
    /// - 已完成的阶段必须是连续的前缀
    /// - 未失败时，恰好一个未完成阶段处于 pending/processing，其后全部 waiting
    /// - `current_stage` 与各阶段状态一致
    pub fn check_invariants(&self) -> Result<(), String> {
        let statuses: Vec<StageStatus> = Stage::ALL.iter().map(|s| self.status(*s)).collect();
        let done = statuses
            .iter()
            .take_while(|s| **s == StageStatus::Completed)
            .count();

        if self.overall_status == OverallStatus::Failed {
            if self.current_stage != CurrentStage::Failed {
                return Err(format!(
                    "失败条目的 current_stage 应为 failed，实际为 {}",
                    self.current_stage
                ));
            }
            return Ok(());
        }

        if done == Stage::ALL.len() {
            return if self.current_stage == CurrentStage::GradeCompleted
                && self.overall_status == OverallStatus::Completed
            {
                Ok(())
            } else {
                Err(format!(
                    "全部阶段完成但状态为 {}/{}",
                    self.current_stage, self.overall_status
                ))
            };
        }

        let active = Stage::ALL[done];
        let active_status = statuses[done];
        if !matches!(active_status, StageStatus::Pending | StageStatus::Processing) {
            return Err(format!("阶段 {} 状态异常: {}", active, active_status));
        }
        if let Some(later) = statuses[done + 1..]
            .iter()
            .position(|s| *s != StageStatus::Waiting)
        {
            return Err(format!(
                "阶段 {} 尚未轮到，状态却为 {}",
                Stage::ALL[done + 1 + later],
                statuses[done + 1 + later]
            ));
        }

        let expected = if done == 0 && active_status == StageStatus::Pending {
            // 刚发现的学生与 extract_pending 等价
            matches!(
                self.current_stage,
                CurrentStage::Discovered | CurrentStage::ExtractPending
            )
        } else {
            self.current_stage == CurrentStage::of(active, active_status)
        };
        if !expected {
            return Err(format!(
                "current_stage {} 与阶段 {} 的状态 {} 不一致",
                self.current_stage, active, active_status
            ));
        }
        Ok(())
    }
}
