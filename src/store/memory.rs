//! 内存存储
//!
//! 所有表放在一把 `tokio::sync::Mutex` 之后，每个方法在一次加锁内完成，
//! 因此认领与计数天然是原子的。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobRepository, MetricsRepository, ProcessingLogRepository, StudentQueueRepository};
use crate::error::{AppError, AppResult, StoreError};
use crate::models::{
    JobStatus, OverallStatus, PipelineJob, PipelineMetrics, ProcessingLogEntry, Stage,
    StageStatus, StudentQueueEntry,
};
use crate::workflow::stage_machine;

#[derive(Default)]
struct Tables {
    jobs: HashMap<String, PipelineJob>,
    entries: HashMap<Uuid, StudentQueueEntry>,
    /// (job_id, roll_number) → 条目
    by_student: HashMap<(String, String), Uuid>,
    /// 插入顺序，用于同一时间创建的条目之间保持先进先出
    insertion: Vec<Uuid>,
    logs: Vec<ProcessingLogEntry>,
    metrics: HashMap<String, PipelineMetrics>,
}

impl Tables {
    fn job_mut(&mut self, job_id: &str) -> AppResult<&mut PipelineJob> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| AppError::not_found(format!("作业 {}", job_id)))
    }

    fn ordered_entries(&self) -> impl Iterator<Item = &StudentQueueEntry> {
        self.insertion.iter().filter_map(|id| self.entries.get(id))
    }
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create_job(&self, job: &PipelineJob) -> AppResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.jobs.contains_key(&job.job_id) {
            return Err(StoreError::DuplicateJob {
                job_id: job.job_id.clone(),
            }
            .into());
        }
        tables.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> AppResult<Option<PipelineJob>> {
        Ok(self.tables.lock().await.jobs.get(job_id).cloned())
    }

    async fn list_jobs(&self) -> AppResult<Vec<PipelineJob>> {
        let tables = self.tables.lock().await;
        let mut jobs: Vec<PipelineJob> = tables.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn mark_discovering(&self, job_id: &str, now: DateTime<Utc>) -> AppResult<PipelineJob> {
        let mut tables = self.tables.lock().await;
        let job = tables.job_mut(job_id)?;
        let restartable = job.status == JobStatus::Initiated
            || (job.status == JobStatus::Failed && job.total_students == 0);
        if !restartable {
            return Err(AppError::invalid_state(format!(
                "作业 {} 状态为 {}，不能开始发现",
                job_id, job.status
            )));
        }
        job.status = JobStatus::Discovering;
        job.discovery_started_at = Some(now);
        job.completed_at = None;
        job.error_message = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn register_roster(
        &self,
        job_id: &str,
        entries: &[StudentQueueEntry],
        now: DateTime<Utc>,
    ) -> AppResult<PipelineJob> {
        let mut tables = self.tables.lock().await;
        {
            let job = tables.job_mut(job_id)?;
            if job.status != JobStatus::Discovering {
                return Err(AppError::invalid_state(format!(
                    "作业 {} 状态为 {}，不能登记名单",
                    job_id, job.status
                )));
            }
        }
        for entry in entries {
            let key = (entry.job_id.clone(), entry.roll_number.clone());
            if tables.by_student.contains_key(&key) {
                return Err(StoreError::DuplicateStudent {
                    job_id: entry.job_id.clone(),
                    roll_number: entry.roll_number.clone(),
                }
                .into());
            }
        }
        for entry in entries {
            tables
                .by_student
                .insert((entry.job_id.clone(), entry.roll_number.clone()), entry.id);
            tables.insertion.push(entry.id);
            tables.entries.insert(entry.id, entry.clone());
        }

        let job = tables.job_mut(job_id)?;
        job.discovered_roll_numbers = entries.iter().map(|e| e.roll_number.clone()).collect();
        job.total_students = entries.len() as i32;
        job.discovery_completed_at = Some(now);
        // roster_ready 在同一把锁内直接推进为 active，外部观察不到中间态
        job.status = JobStatus::Active;
        job.pipeline_started_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn fail_job(
        &self,
        job_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> AppResult<PipelineJob> {
        let mut tables = self.tables.lock().await;
        let job = tables.job_mut(job_id)?;
        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn sync_student_counts(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<(PipelineJob, bool)> {
        let mut tables = self.tables.lock().await;
        let (mut completed, mut failed) = (0, 0);
        for entry in tables.entries.values().filter(|e| e.job_id == job_id) {
            match entry.overall_status {
                OverallStatus::Completed => completed += 1,
                OverallStatus::Failed => failed += 1,
                _ => {}
            }
        }
        let job = tables.job_mut(job_id)?;
        let changed = job.sync_counts(completed, failed, now);
        Ok((job.clone(), changed))
    }
}

#[async_trait]
impl StudentQueueRepository for MemoryStore {
    async fn find_pending(
        &self,
        stage: Stage,
        limit: usize,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<StudentQueueEntry>> {
        let tables = self.tables.lock().await;
        let mut ready: Vec<StudentQueueEntry> = tables
            .ordered_entries()
            .filter(|e| e.is_ready_for(stage, now))
            .cloned()
            .collect();
        // 稳定排序：同优先级、同创建时间时保持插入顺序
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        ready.truncate(limit);
        Ok(ready)
    }

    async fn claim_for_processing(
        &self,
        entry_id: Uuid,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> AppResult<Option<StudentQueueEntry>> {
        let mut tables = self.tables.lock().await;
        let Some(entry) = tables.entries.get_mut(&entry_id) else {
            return Ok(None);
        };
        if !entry.is_ready_for(stage, now) {
            return Ok(None);
        }
        if stage_machine::claim(entry, stage, now).is_err() {
            return Ok(None);
        }
        entry.version += 1;
        Ok(Some(entry.clone()))
    }

    async fn update_entry(&self, entry: &StudentQueueEntry) -> AppResult<bool> {
        let mut tables = self.tables.lock().await;
        let Some(stored) = tables.entries.get_mut(&entry.id) else {
            return Err(AppError::not_found(format!("队列条目 {}", entry.id)));
        };
        if stored.version != entry.version {
            return Ok(false);
        }
        *stored = entry.clone();
        stored.version += 1;
        Ok(true)
    }

    async fn get_entry(
        &self,
        job_id: &str,
        roll_number: &str,
    ) -> AppResult<Option<StudentQueueEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .by_student
            .get(&(job_id.to_string(), roll_number.to_string()))
            .and_then(|id| tables.entries.get(id))
            .cloned())
    }

    async fn list_entries(&self, job_id: Option<&str>) -> AppResult<Vec<StudentQueueEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .ordered_entries()
            .filter(|e| job_id.map_or(true, |id| e.job_id == id))
            .cloned()
            .collect())
    }

    async fn find_stuck(
        &self,
        stage: Stage,
        started_before: DateTime<Utc>,
    ) -> AppResult<Vec<StudentQueueEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .ordered_entries()
            .filter(|e| {
                let record = e.stage(stage);
                record.status == StageStatus::Processing
                    && record.started_at.map_or(true, |at| at < started_before)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ProcessingLogRepository for MemoryStore {
    async fn append_log(&self, entry: &ProcessingLogEntry) -> AppResult<()> {
        self.tables.lock().await.logs.push(entry.clone());
        Ok(())
    }

    async fn recent_logs(
        &self,
        job_id: &str,
        roll_number: &str,
        limit: usize,
    ) -> AppResult<Vec<ProcessingLogEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .logs
            .iter()
            .rev()
            .filter(|log| {
                log.job_id.as_deref() == Some(job_id)
                    && log.roll_number.as_deref() == Some(roll_number)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut tables = self.tables.lock().await;
        let before = tables.logs.len();
        tables.logs.retain(|log| log.timestamp >= cutoff);
        Ok((before - tables.logs.len()) as u64)
    }
}

#[async_trait]
impl MetricsRepository for MemoryStore {
    async fn upsert_metrics(&self, metrics: &PipelineMetrics) -> AppResult<()> {
        self.tables
            .lock()
            .await
            .metrics
            .insert(metrics.job_id.clone(), metrics.clone());
        Ok(())
    }

    async fn get_metrics(&self, job_id: &str) -> AppResult<Option<PipelineMetrics>> {
        Ok(self.tables.lock().await.metrics.get(job_id).cloned())
    }
}
