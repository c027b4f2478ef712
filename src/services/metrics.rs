//! 统计服务 - 业务能力层
//!
//! 定期从学生队列重算每个作业的统计；计数取作业表，耗时取已完成的条目。

use std::sync::Arc;

use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::{JobStatus, PipelineJob, PipelineMetrics, Stage, StudentQueueEntry};
use crate::store::{JobRepository, MetricsRepository, PipelineStore, StudentQueueRepository};
use crate::utils::time::now;

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| (sum / count as f64 * 100.0).round() / 100.0)
}

/// 由作业和它的条目算出统计
pub fn compute_metrics(job: &PipelineJob, entries: &[StudentQueueEntry]) -> PipelineMetrics {
    let stage_avg =
        |stage: Stage| average(entries.iter().filter_map(|e| e.stage(stage).duration_secs()));

    PipelineMetrics {
        job_id: job.job_id.clone(),
        total_students: job.total_students,
        completed: job.students_completed,
        failed: job.students_failed,
        avg_total_time: average(entries.iter().filter_map(|e| e.total_duration_secs()))
            .unwrap_or(0.0),
        avg_extract_time: stage_avg(Stage::Extract),
        avg_chunk_time: stage_avg(Stage::Chunk),
        avg_map_time: stage_avg(Stage::Map),
        avg_grade_time: stage_avg(Stage::Grade),
        updated_at: now(),
    }
}

/// 统计服务
#[derive(Clone)]
pub struct MetricsAggregator {
    store: Arc<dyn PipelineStore>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// 重算一个作业的统计并写入统计表
    pub async fn recompute(&self, job_id: &str) -> AppResult<PipelineMetrics> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("作业 {}", job_id)))?;
        let entries = self.store.list_entries(Some(job_id)).await?;
        let metrics = compute_metrics(&job, &entries);
        self.store.upsert_metrics(&metrics).await?;
        Ok(metrics)
    }

    /// 重算所有需要更新的作业，返回处理的作业数
    ///
    /// 进行中的作业每次都算；已结束的作业只在统计缺失或早于结束时间时补算一次。
    pub async fn recompute_all(&self) -> AppResult<usize> {
        let mut refreshed = 0;
        for job in self.store.list_jobs().await? {
            if job.total_students == 0 {
                continue;
            }
            let due = match job.status {
                JobStatus::Active => true,
                JobStatus::Completed | JobStatus::Failed => {
                    match self.store.get_metrics(&job.job_id).await? {
                        Some(existing) => job
                            .completed_at
                            .map_or(false, |done| existing.updated_at < done),
                        None => true,
                    }
                }
                _ => false,
            };
            if due {
                self.recompute(&job.job_id).await?;
                refreshed += 1;
            }
        }
        debug!("统计已刷新: {} 个作业", refreshed);
        Ok(refreshed)
    }

    pub async fn get(&self, job_id: &str) -> AppResult<Option<PipelineMetrics>> {
        self.store.get_metrics(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StageStatus;
    use chrono::{Duration, Utc};

    #[test]
    fn test_compute_metrics_averages_finished_work() {
        let start = Utc::now();
        let mut job = PipelineJob::new("job_1", "qp-1", None, start);
        job.total_students = 2;
        job.students_completed = 1;

        let mut done = StudentQueueEntry::new("job_1", "qp-1", "1", 3, start);
        for (i, stage) in Stage::ALL.into_iter().enumerate() {
            let record = done.stage_mut(stage);
            record.status = StageStatus::Completed;
            record.started_at = Some(start + Duration::seconds(10 * i as i64));
            record.completed_at = Some(start + Duration::seconds(10 * i as i64 + 4));
        }
        let mut half = StudentQueueEntry::new("job_1", "qp-1", "2", 3, start);
        half.extract.status = StageStatus::Completed;
        half.extract.started_at = Some(start);
        half.extract.completed_at = Some(start + Duration::seconds(8));

        let metrics = compute_metrics(&job, &[done, half]);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.avg_extract_time, Some(6.0));
        assert_eq!(metrics.avg_grade_time, Some(4.0));
        assert_eq!(metrics.avg_total_time, 34.0);
        assert_eq!(metrics.completion_rate(), 50.0);
    }

    #[test]
    fn test_no_finished_work_has_no_averages() {
        let job = PipelineJob::new("job_1", "qp-1", None, Utc::now());
        let metrics = compute_metrics(&job, &[]);
        assert_eq!(metrics.avg_total_time, 0.0);
        assert!(metrics.avg_map_time.is_none());
    }
}
