//! 学生阶段状态机 - 流程层
//!
//! 每个处理阶段的状态：`pending → processing → {completed | pending(重试) | failed}`
//!
//! 规则：
//! 1. `pending → processing` 只能经由认领（见 `store` 的比较并交换）
//! 2. `processing → completed` 推进到下一阶段的 pending，最后一个阶段则整体完成
//! 3. `processing → pending` 瞬时失败且还有重试次数，`retry_count + 1`
//! 4. `processing → failed` 重试用尽或永久失败
//!
//! 不允许跳过阶段，也不允许跨阶段后退；唯一的例外是操作员重试
//! （[`reset_failed`]），它只把失败的那个阶段放回 pending。

use chrono::{DateTime, Utc};

use super::backoff::BackoffPolicy;
use crate::error::{AdapterError, PipelineError};
use crate::models::{CurrentStage, OverallStatus, Stage, StageStatus, StudentQueueEntry};

/// 一次阶段调用失败的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub retryable: bool,
    pub message: String,
}

impl StageFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl From<&AdapterError> for StageFailure {
    fn from(err: &AdapterError) -> Self {
        Self {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

/// 状态转换的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 认领成功，进入 processing
    Claimed,
    /// 本阶段完成，进入下一阶段的 pending
    Advanced { next: Stage },
    /// 最后一个阶段完成，学生整体完成
    Finished,
    /// 瞬时失败，回到本阶段 pending，等待退避后重试
    Retrying {
        attempt: i32,
        delay: std::time::Duration,
    },
    /// 失败且不再自动重试
    Failed,
}

impl Transition {
    /// 学生是否因此进入终态
    pub fn is_terminal(self) -> bool {
        matches!(self, Transition::Finished | Transition::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            Transition::Claimed => "processing",
            Transition::Advanced { .. } | Transition::Finished => "completed",
            Transition::Retrying { .. } => "retrying",
            Transition::Failed => "failed",
        }
    }
}

fn expect_status(
    entry: &StudentQueueEntry,
    stage: Stage,
    expected: StageStatus,
) -> Result<(), PipelineError> {
    let actual = entry.status(stage);
    if actual != expected {
        return Err(PipelineError::InvalidState(format!(
            "学号 {} 阶段 {} 状态为 {}，需要 {}",
            entry.roll_number, stage, actual, expected
        )));
    }
    Ok(())
}

/// `pending → processing`
pub fn claim(
    entry: &mut StudentQueueEntry,
    stage: Stage,
    now: DateTime<Utc>,
) -> Result<Transition, PipelineError> {
    expect_status(entry, stage, StageStatus::Pending)?;
    if entry.is_terminal() {
        return Err(PipelineError::InvalidState(format!(
            "学号 {} 已处于终态 {}",
            entry.roll_number, entry.overall_status
        )));
    }

    let record = entry.stage_mut(stage);
    record.status = StageStatus::Processing;
    record.started_at = Some(now);
    record.completed_at = None;

    entry.current_stage = stage.processing_state();
    entry.overall_status = OverallStatus::Processing;
    entry.next_attempt_at = None;
    entry.updated_at = now;
    Ok(Transition::Claimed)
}

/// `processing → completed`，并推进到下一阶段
pub fn complete(
    entry: &mut StudentQueueEntry,
    stage: Stage,
    now: DateTime<Utc>,
) -> Result<Transition, PipelineError> {
    expect_status(entry, stage, StageStatus::Processing)?;

    let record = entry.stage_mut(stage);
    record.status = StageStatus::Completed;
    record.completed_at = Some(now);

    entry.error_message = None;
    entry.updated_at = now;

    match stage.next() {
        Some(next) => {
            entry.stage_mut(next).status = StageStatus::Pending;
            entry.current_stage = next.pending_state();
            entry.overall_status = OverallStatus::Pending;
            Ok(Transition::Advanced { next })
        }
        None => {
            entry.current_stage = CurrentStage::GradeCompleted;
            entry.overall_status = OverallStatus::Completed;
            Ok(Transition::Finished)
        }
    }
}

/// `processing → pending(重试)` 或 `processing → failed`
pub fn fail(
    entry: &mut StudentQueueEntry,
    stage: Stage,
    failure: &StageFailure,
    backoff: &BackoffPolicy,
    now: DateTime<Utc>,
) -> Result<Transition, PipelineError> {
    expect_status(entry, stage, StageStatus::Processing)?;

    entry.error_message = Some(failure.message.clone());
    entry.updated_at = now;

    if failure.retryable && entry.retry_count < entry.max_retries {
        entry.retry_count += 1;
        let delay = backoff.delay_for(entry.retry_count);

        let record = entry.stage_mut(stage);
        record.status = StageStatus::Pending;
        record.started_at = None;

        entry.current_stage = stage.pending_state();
        entry.overall_status = OverallStatus::Pending;
        entry.next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| now + d);
        return Ok(Transition::Retrying {
            attempt: entry.retry_count,
            delay,
        });
    }

    mark_failed(entry, stage);
    Ok(Transition::Failed)
}

/// 操作员强制失败：停止对当前阶段的自动重试
pub fn force_fail(
    entry: &mut StudentQueueEntry,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Stage, PipelineError> {
    if entry.is_terminal() {
        return Err(PipelineError::InvalidState(format!(
            "学号 {} 已处于终态 {}",
            entry.roll_number, entry.overall_status
        )));
    }
    let stage = entry.active_stage().ok_or_else(|| {
        PipelineError::InvalidState(format!("学号 {} 没有未完成的阶段", entry.roll_number))
    })?;

    mark_failed(entry, stage);
    entry.next_attempt_at = None;
    entry.error_message = Some(reason.to_string());
    entry.updated_at = now;
    Ok(stage)
}

/// 操作员重试：只把失败的阶段放回 pending，已完成的阶段保持不变
pub fn reset_failed(
    entry: &mut StudentQueueEntry,
    now: DateTime<Utc>,
) -> Result<Stage, PipelineError> {
    if entry.overall_status != OverallStatus::Failed {
        return Err(PipelineError::InvalidState(format!(
            "学号 {} 不处于失败状态 (当前: {})",
            entry.roll_number, entry.overall_status
        )));
    }

    // 没有记录失败阶段时，从第一个未完成的阶段重新开始
    let stage = entry
        .failed_stage()
        .or_else(|| entry.active_stage())
        .unwrap_or(Stage::Extract);

    let record = entry.stage_mut(stage);
    record.status = StageStatus::Pending;
    record.started_at = None;
    record.completed_at = None;

    entry.current_stage = stage.pending_state();
    entry.overall_status = OverallStatus::Pending;
    entry.retry_count = 0;
    entry.error_message = None;
    entry.next_attempt_at = None;
    entry.updated_at = now;
    Ok(stage)
}

fn mark_failed(entry: &mut StudentQueueEntry, stage: Stage) {
    entry.stage_mut(stage).status = StageStatus::Failed;
    entry.current_stage = CurrentStage::Failed;
    entry.overall_status = OverallStatus::Failed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(max_retries: i32) -> StudentQueueEntry {
        StudentQueueEntry::new("job_1", "qp-1", "2", max_retries, Utc::now())
    }

    fn run_through(entry: &mut StudentQueueEntry, stage: Stage) -> Transition {
        claim(entry, stage, Utc::now()).unwrap();
        complete(entry, stage, Utc::now()).unwrap()
    }

    #[test]
    fn test_happy_path_moves_forward_only() {
        let mut e = entry(3);
        let mut last = e.current_stage.ordinal();
        for stage in Stage::ALL {
            claim(&mut e, stage, Utc::now()).unwrap();
            assert!(e.current_stage.ordinal() > last);
            last = e.current_stage.ordinal();
            e.check_invariants().unwrap();

            let t = complete(&mut e, stage, Utc::now()).unwrap();
            assert!(e.current_stage.ordinal() > last);
            last = e.current_stage.ordinal();
            e.check_invariants().unwrap();

            if stage == Stage::Grade {
                assert_eq!(t, Transition::Finished);
            } else {
                assert_eq!(t, Transition::Advanced { next: stage.next().unwrap() });
            }
        }
        assert_eq!(e.overall_status, OverallStatus::Completed);
        assert_eq!(e.current_stage, CurrentStage::GradeCompleted);
    }

    #[test]
    fn test_transient_failures_then_success() {
        let mut e = entry(3);
        let backoff = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(60));
        for attempt in 1..=2 {
            claim(&mut e, Stage::Extract, Utc::now()).unwrap();
            let t = fail(
                &mut e,
                Stage::Extract,
                &StageFailure::transient("503"),
                &backoff,
                Utc::now(),
            )
            .unwrap();
            assert!(matches!(t, Transition::Retrying { attempt: a, .. } if a == attempt));
            assert_eq!(e.status(Stage::Extract), StageStatus::Pending);
            assert!(e.extract.started_at.is_none());
            assert!(e.next_attempt_at.is_some());
            e.check_invariants().unwrap();
        }
        assert_eq!(run_through(&mut e, Stage::Extract), Transition::Advanced { next: Stage::Chunk });
        assert_eq!(e.retry_count, 2);
        assert_eq!(e.status(Stage::Extract), StageStatus::Completed);
    }

    #[test]
    fn test_retries_exhausted() {
        let mut e = entry(2);
        let backoff = BackoffPolicy::none();
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            claim(&mut e, Stage::Extract, Utc::now()).unwrap();
            outcomes.push(
                fail(&mut e, Stage::Extract, &StageFailure::transient("timeout"), &backoff, Utc::now())
                    .unwrap(),
            );
            assert!(e.retry_count <= e.max_retries);
        }
        assert_eq!(outcomes[2], Transition::Failed);
        assert_eq!(e.overall_status, OverallStatus::Failed);
        assert_eq!(e.current_stage, CurrentStage::Failed);
    }

    #[test]
    fn test_permanent_failure_fails_immediately() {
        let mut e = entry(3);
        run_through(&mut e, Stage::Extract);
        run_through(&mut e, Stage::Chunk);
        claim(&mut e, Stage::Map, Utc::now()).unwrap();
        let t = fail(
            &mut e,
            Stage::Map,
            &StageFailure::permanent("missing question paper"),
            &BackoffPolicy::none(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(t, Transition::Failed);
        assert_eq!(e.retry_count, 0);
        assert_eq!(e.status(Stage::Map), StageStatus::Failed);
        e.check_invariants().unwrap();
    }

    #[test]
    fn test_reset_failed_preserves_completed_stages() {
        let mut e = entry(3);
        run_through(&mut e, Stage::Extract);
        run_through(&mut e, Stage::Chunk);
        claim(&mut e, Stage::Map, Utc::now()).unwrap();
        fail(&mut e, Stage::Map, &StageFailure::permanent("bad"), &BackoffPolicy::none(), Utc::now())
            .unwrap();
        let extract_before = e.extract.clone();

        let stage = reset_failed(&mut e, Utc::now()).unwrap();
        assert_eq!(stage, Stage::Map);
        assert_eq!(e.extract, extract_before);
        assert_eq!(e.status(Stage::Chunk), StageStatus::Completed);
        assert_eq!(e.status(Stage::Map), StageStatus::Pending);
        assert_eq!(e.overall_status, OverallStatus::Pending);
        assert_eq!(e.current_stage, CurrentStage::MapPending);
        assert_eq!(e.retry_count, 0);
        assert!(e.error_message.is_none());
        e.check_invariants().unwrap();
    }

    #[test]
    fn test_reset_requires_failed_state() {
        let mut e = entry(3);
        assert!(reset_failed(&mut e, Utc::now()).is_err());
    }

    #[test]
    fn test_claim_requires_pending() {
        let mut e = entry(3);
        claim(&mut e, Stage::Extract, Utc::now()).unwrap();
        assert!(claim(&mut e, Stage::Extract, Utc::now()).is_err());
        assert!(claim(&mut e, Stage::Chunk, Utc::now()).is_err());
    }

    #[test]
    fn test_force_fail_stops_pending_student() {
        let mut e = entry(3);
        run_through(&mut e, Stage::Extract);
        let stage = force_fail(&mut e, "operator stop", Utc::now()).unwrap();
        assert_eq!(stage, Stage::Chunk);
        assert_eq!(e.overall_status, OverallStatus::Failed);
        assert!(force_fail(&mut e, "again", Utc::now()).is_err());
    }
}
