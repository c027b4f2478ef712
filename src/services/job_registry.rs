//! 作业登记服务 - 业务能力层
//!
//! ## 职责
//!
//! - 新建作业，`job_id` 重复时拒绝
//! - 发现阶段结束后登记名单、批量建立学生条目
//! - 按学生条目的终态重算计数，全部结束时完成作业
//! - 对进行中的作业做对账，补上漏掉的重算
//! - 作业快照：各阶段计数与正在处理的学生
//!
//! 学生条目的终态是权威数据；作业表里的计数由它重算得出，统计表只是定期重算的缓存。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AppError, AppResult, PipelineError};
use crate::models::{
    JobStatus, PipelineJob, Stage, StageStatus, StudentQueueEntry,
};
use crate::store::{JobRepository, PipelineStore, StudentQueueRepository};
use crate::utils::time::now;

/// 某阶段各状态的学生数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub waiting: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StageCounts {
    pub fn tally<'a>(stage: Stage, entries: impl IntoIterator<Item = &'a StudentQueueEntry>) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            match entry.status(stage) {
                StageStatus::Waiting => counts.waiting += 1,
                StageStatus::Pending => counts.pending += 1,
                StageStatus::Processing => counts.processing += 1,
                StageStatus::Completed => counts.completed += 1,
                StageStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// 正在调用外部服务的学生
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStudent {
    pub roll_number: String,
    pub stage: Stage,
    pub started_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

/// 作业快照
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job: PipelineJob,
    pub completion_rate: f64,
    pub stage_counts: Vec<(Stage, StageCounts)>,
    pub currently_processing: Vec<ProcessingStudent>,
}

/// 作业登记服务
#[derive(Clone)]
pub struct JobRegistry {
    store: Arc<dyn PipelineStore>,
    max_retries: i32,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn PipelineStore>, max_retries: i32) -> Self {
        Self { store, max_retries }
    }

    /// 新建作业，状态为 initiated
    pub async fn create_job(
        &self,
        job_id: &str,
        question_paper_id: &str,
        source_ref: Option<String>,
    ) -> AppResult<PipelineJob> {
        let job = PipelineJob::new(job_id, question_paper_id, source_ref, now());
        self.store.create_job(&job).await?;
        info!("📝 作业 {} 已创建 (试卷 {})", job_id, question_paper_id);
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> AppResult<PipelineJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("作业 {}", job_id)))
    }

    pub async fn list_jobs(&self) -> AppResult<Vec<PipelineJob>> {
        self.store.list_jobs().await
    }

    /// 进入 discovering
    pub async fn begin_discovery(&self, job_id: &str) -> AppResult<PipelineJob> {
        self.store.mark_discovering(job_id, now()).await
    }

    /// 登记名单：每个学号建一条学生条目，作业经 roster_ready 进入 active
    ///
    /// 名单为空时返回 `PipelineError::EmptyRoster`，不写入任何条目。
    pub async fn register_discovery(
        &self,
        job_id: &str,
        roll_numbers: &[String],
    ) -> AppResult<PipelineJob> {
        if roll_numbers.is_empty() {
            return Err(PipelineError::EmptyRoster.into());
        }
        let job = self.get_job(job_id).await?;
        let ts = now();
        let entries: Vec<StudentQueueEntry> = roll_numbers
            .iter()
            .map(|roll| {
                StudentQueueEntry::new(job_id, &job.question_paper_id, roll, self.max_retries, ts)
            })
            .collect();

        let job = self.store.register_roster(job_id, &entries, ts).await?;
        info!(
            "📋 作业 {} 名单就绪: {} 名学生，进入 {}",
            job_id, job.total_students, job.status
        );
        Ok(job)
    }

    /// 发现阶段失败，作业直接失败
    pub async fn fail_discovery(&self, job_id: &str, error: &str) -> AppResult<PipelineJob> {
        self.store.fail_job(job_id, error, now()).await
    }

    /// 按学生条目的终态重算作业计数
    ///
    /// 学生到达终态或被重新排队后调用。计数总是整体重算，重复调用没有副作用。
    pub async fn sync_counts(&self, job_id: &str) -> AppResult<PipelineJob> {
        let (job, changed) = self.store.sync_student_counts(job_id, now()).await?;
        if changed && job.status == JobStatus::Completed {
            info!(
                "🏁 作业 {} 全部学生处理结束: 成功 {} / 失败 {} / 共 {}",
                job_id, job.students_completed, job.students_failed, job.total_students
            );
        }
        Ok(job)
    }

    /// 对账：重算所有进行中作业的计数，返回被修正的作业数
    ///
    /// 写回条目成功而重算失败（数据库错误、进程退出）时，作业计数会落后于条目，
    /// 这里把它补上。
    pub async fn reconcile_active_jobs(&self) -> AppResult<usize> {
        let mut fixed = 0;
        for job in self.store.list_jobs().await? {
            if job.status != JobStatus::Active {
                continue;
            }
            let (synced, changed) = self.store.sync_student_counts(&job.job_id, now()).await?;
            if changed {
                fixed += 1;
                warn!(
                    "🧮 作业 {} 计数已对账: 成功 {} → {} / 失败 {} → {} ({})",
                    job.job_id,
                    job.students_completed,
                    synced.students_completed,
                    job.students_failed,
                    synced.students_failed,
                    synced.status
                );
            }
        }
        Ok(fixed)
    }

    /// 作业快照：按学生队列现算各阶段计数
    pub async fn get_job_status(&self, job_id: &str) -> AppResult<JobSnapshot> {
        let job = self.get_job(job_id).await?;
        let entries = self.store.list_entries(Some(job_id)).await?;

        let stage_counts = Stage::ALL
            .into_iter()
            .map(|stage| (stage, StageCounts::tally(stage, &entries)))
            .collect();

        let currently_processing = entries
            .iter()
            .filter_map(|entry| {
                Stage::ALL
                    .into_iter()
                    .find(|s| entry.status(*s) == StageStatus::Processing)
                    .map(|stage| ProcessingStudent {
                        roll_number: entry.roll_number.clone(),
                        stage,
                        started_at: entry.stage(stage).started_at,
                        retry_count: entry.retry_count,
                    })
            })
            .collect();

        Ok(JobSnapshot {
            completion_rate: job.completion_rate(),
            job,
            stage_counts,
            currently_processing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use crate::workflow::{stage_machine, BackoffPolicy, StageFailure};

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(MemoryStore::new()), 3)
    }

    fn rolls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_create_job_rejects_duplicate() {
        let registry = registry();
        registry.create_job("job_1", "qp-1", None).await.unwrap();
        let err = registry.create_job("job_1", "qp-1", None).await.unwrap_err();
        assert!(matches!(err, AppError::Store(StoreError::DuplicateJob { .. })));
    }

    #[tokio::test]
    async fn test_register_discovery_builds_roster() {
        let registry = registry();
        registry.create_job("job_1", "qp-1", None).await.unwrap();
        registry.begin_discovery("job_1").await.unwrap();
        let job = registry
            .register_discovery("job_1", &rolls(&["1", "2", "3"]))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.total_students, job.discovered_roll_numbers.len() as i32);

        let snapshot = registry.get_job_status("job_1").await.unwrap();
        let (stage, extract) = &snapshot.stage_counts[0];
        assert_eq!(*stage, Stage::Extract);
        assert_eq!(extract.pending, 3);
        assert_eq!(snapshot.stage_counts[1].1.waiting, 3);
        assert!(snapshot.currently_processing.is_empty());
    }

    #[tokio::test]
    async fn test_empty_roster_is_rejected() {
        let registry = registry();
        registry.create_job("job_1", "qp-1", None).await.unwrap();
        registry.begin_discovery("job_1").await.unwrap();
        let err = registry.register_discovery("job_1", &[]).await.unwrap_err();
        assert!(matches!(err, AppError::Pipeline(PipelineError::EmptyRoster)));
    }

    /// 在条目副本上推进阶段并写回；`fail_at` 处永久失败
    async fn drive(store: &Arc<dyn PipelineStore>, roll: &str, fail_at: Option<Stage>) {
        let mut entry = store.get_entry("job_1", roll).await.unwrap().unwrap();
        let t = now();
        for stage in Stage::ALL {
            if entry.status(stage) != StageStatus::Pending {
                continue;
            }
            stage_machine::claim(&mut entry, stage, t).unwrap();
            if fail_at == Some(stage) {
                let failure = StageFailure::permanent("bad input");
                stage_machine::fail(&mut entry, stage, &failure, &BackoffPolicy::none(), t).unwrap();
                break;
            }
            stage_machine::complete(&mut entry, stage, t).unwrap();
        }
        assert!(store.update_entry(&entry).await.unwrap());
    }

    async fn active_registry(roster: &[&str]) -> (Arc<dyn PipelineStore>, JobRegistry) {
        let store: Arc<dyn PipelineStore> = Arc::new(MemoryStore::new());
        let registry = JobRegistry::new(store.clone(), 3);
        registry.create_job("job_1", "qp-1", None).await.unwrap();
        registry.begin_discovery("job_1").await.unwrap();
        registry.register_discovery("job_1", &rolls(roster)).await.unwrap();
        (store, registry)
    }

    #[tokio::test]
    async fn test_terminal_outcomes_complete_job() {
        let (store, registry) = active_registry(&["1", "2"]).await;

        drive(&store, "1", Some(Stage::Chunk)).await;
        let job = registry.sync_counts("job_1").await.unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.students_failed, 1);

        drive(&store, "2", None).await;
        let job = registry.sync_counts("job_1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.students_completed, 1);
        assert_eq!(job.students_failed, 1);

        // 重复重算不会多计
        let job = registry.sync_counts("job_1").await.unwrap();
        assert_eq!(job.finished_students(), 2);
    }

    #[tokio::test]
    async fn test_retried_student_finishing_before_reopen_still_completes_job() {
        let (store, registry) = active_registry(&["1"]).await;
        drive(&store, "1", Some(Stage::Map)).await;
        let job = registry.sync_counts("job_1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        // 操作员重新排队
        let mut entry = store.get_entry("job_1", "1").await.unwrap().unwrap();
        stage_machine::reset_failed(&mut entry, now()).unwrap();
        assert!(store.update_entry(&entry).await.unwrap());

        // worker 在操作员重算之前就跑完并重算
        drive(&store, "1", None).await;
        registry.sync_counts("job_1").await.unwrap();
        // 操作员这一侧的重算随后才到
        let job = registry.sync_counts("job_1").await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.students_completed, 1);
        assert_eq!(job.students_failed, 0);
    }

    #[tokio::test]
    async fn test_reconcile_repairs_missed_sync() {
        let (store, registry) = active_registry(&["1"]).await;
        // 条目写回成功，但没有重算
        drive(&store, "1", None).await;
        assert_eq!(registry.get_job("job_1").await.unwrap().status, JobStatus::Active);

        assert_eq!(registry.reconcile_active_jobs().await.unwrap(), 1);
        let job = registry.get_job("job_1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.students_completed, 1);

        assert_eq!(registry.reconcile_active_jobs().await.unwrap(), 0);
    }
}
