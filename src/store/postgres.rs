//! Postgres 存储
//!
//! 认领用带条件的 `UPDATE ... RETURNING`，写回用版本号比对，作业计数在
//! `SELECT ... FOR UPDATE` 事务内累加。多台机器上的 worker 可以共享同一个库。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use super::{JobRepository, MetricsRepository, ProcessingLogRepository, StudentQueueRepository};
use crate::error::{AppError, AppResult, StoreError};
use crate::models::{
    JobStatus, PipelineJob, PipelineMetrics, ProcessingLogEntry, Stage, StageRecord,
    StudentQueueEntry,
};

const SCHEMA: &str = include_str!("../../migrations/0001_pipeline.sql");

/// Postgres 存储
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// 连接数据库并确保表结构存在
    pub async fn connect(database_url: &str, max_connections: u32) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 建表（幂等）
    pub async fn ensure_schema(&self) -> AppResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("✓ 数据库表结构已就绪");
        Ok(())
    }

    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        job_id: &str,
    ) -> AppResult<PipelineJob> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM pipeline_jobs WHERE job_id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?;
        match row {
            Some(row) => Ok(row.try_into()?),
            None => Err(AppError::not_found(format!("作业 {}", job_id))),
        }
    }

    async fn save_job(tx: &mut Transaction<'_, Postgres>, job: &PipelineJob) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_jobs SET
                status = $2,
                discovered_roll_numbers = $3,
                total_students = $4,
                students_completed = $5,
                students_failed = $6,
                discovery_started_at = $7,
                discovery_completed_at = $8,
                pipeline_started_at = $9,
                completed_at = $10,
                updated_at = $11,
                error_message = $12
            WHERE job_id = $1
            "#,
        )
        .bind(&job.job_id)
        .bind(job.status.as_str())
        .bind(&job.discovered_roll_numbers)
        .bind(job.total_students)
        .bind(job.students_completed)
        .bind(job.students_failed)
        .bind(job.discovery_started_at)
        .bind(job.discovery_completed_at)
        .bind(job.pipeline_started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(&job.error_message)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// 在行锁内修改作业并写回
    async fn modify_job<F>(&self, job_id: &str, apply: F) -> AppResult<PipelineJob>
    where
        F: FnOnce(&mut PipelineJob) -> AppResult<()> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        apply(&mut job)?;
        Self::save_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }
}

// ========== 行结构 ==========

#[derive(FromRow)]
struct JobRow {
    job_id: String,
    question_paper_id: String,
    source_ref: Option<String>,
    status: String,
    discovered_roll_numbers: Vec<String>,
    total_students: i32,
    students_completed: i32,
    students_failed: i32,
    created_at: DateTime<Utc>,
    discovery_started_at: Option<DateTime<Utc>>,
    discovery_completed_at: Option<DateTime<Utc>>,
    pipeline_started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    error_message: Option<String>,
}

impl TryFrom<JobRow> for PipelineJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(PipelineJob {
            job_id: row.job_id,
            question_paper_id: row.question_paper_id,
            source_ref: row.source_ref,
            status: row.status.parse::<JobStatus>()?,
            discovered_roll_numbers: row.discovered_roll_numbers,
            total_students: row.total_students,
            students_completed: row.students_completed,
            students_failed: row.students_failed,
            created_at: row.created_at,
            discovery_started_at: row.discovery_started_at,
            discovery_completed_at: row.discovery_completed_at,
            pipeline_started_at: row.pipeline_started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
            error_message: row.error_message,
        })
    }
}

#[derive(FromRow)]
struct StudentRow {
    id: Uuid,
    job_id: String,
    question_paper_id: String,
    roll_number: String,
    current_stage: String,
    overall_status: String,
    extract_status: String,
    extract_started_at: Option<DateTime<Utc>>,
    extract_completed_at: Option<DateTime<Utc>>,
    chunk_status: String,
    chunk_started_at: Option<DateTime<Utc>>,
    chunk_completed_at: Option<DateTime<Utc>>,
    map_status: String,
    map_started_at: Option<DateTime<Utc>>,
    map_completed_at: Option<DateTime<Utc>>,
    grade_status: String,
    grade_started_at: Option<DateTime<Utc>>,
    grade_completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    priority: i32,
    error_message: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn stage_record(
    status: &str,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<StageRecord, StoreError> {
    Ok(StageRecord {
        status: status.parse()?,
        started_at,
        completed_at,
    })
}

impl TryFrom<StudentRow> for StudentQueueEntry {
    type Error = StoreError;

    fn try_from(row: StudentRow) -> Result<Self, Self::Error> {
        Ok(StudentQueueEntry {
            id: row.id,
            job_id: row.job_id,
            question_paper_id: row.question_paper_id,
            roll_number: row.roll_number,
            current_stage: row.current_stage.parse()?,
            overall_status: row.overall_status.parse()?,
            extract: stage_record(
                &row.extract_status,
                row.extract_started_at,
                row.extract_completed_at,
            )?,
            chunk: stage_record(&row.chunk_status, row.chunk_started_at, row.chunk_completed_at)?,
            map: stage_record(&row.map_status, row.map_started_at, row.map_completed_at)?,
            grade: stage_record(&row.grade_status, row.grade_started_at, row.grade_completed_at)?,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            priority: row.priority,
            error_message: row.error_message,
            next_attempt_at: row.next_attempt_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_entries(rows: Vec<StudentRow>) -> AppResult<Vec<StudentQueueEntry>> {
    rows.into_iter()
        .map(|row| StudentQueueEntry::try_from(row).map_err(AppError::from))
        .collect()
}

#[derive(FromRow)]
struct LogRow {
    id: Uuid,
    student_entry_id: Option<Uuid>,
    job_id: Option<String>,
    roll_number: Option<String>,
    stage: String,
    status: String,
    message: String,
    duration_seconds: Option<f64>,
    timestamp: DateTime<Utc>,
}

impl From<LogRow> for ProcessingLogEntry {
    fn from(row: LogRow) -> Self {
        ProcessingLogEntry {
            id: row.id,
            student_entry_id: row.student_entry_id,
            job_id: row.job_id,
            roll_number: row.roll_number,
            stage: row.stage,
            status: row.status,
            message: row.message,
            duration_seconds: row.duration_seconds,
            timestamp: row.timestamp,
        }
    }
}

#[derive(FromRow)]
struct MetricsRow {
    job_id: String,
    total_students: i32,
    completed: i32,
    failed: i32,
    avg_total_time: f64,
    avg_extract_time: Option<f64>,
    avg_chunk_time: Option<f64>,
    avg_map_time: Option<f64>,
    avg_grade_time: Option<f64>,
    updated_at: DateTime<Utc>,
}

impl From<MetricsRow> for PipelineMetrics {
    fn from(row: MetricsRow) -> Self {
        PipelineMetrics {
            job_id: row.job_id,
            total_students: row.total_students,
            completed: row.completed,
            failed: row.failed,
            avg_total_time: row.avg_total_time,
            avg_extract_time: row.avg_extract_time,
            avg_chunk_time: row.avg_chunk_time,
            avg_map_time: row.avg_map_time,
            avg_grade_time: row.avg_grade_time,
            updated_at: row.updated_at,
        }
    }
}

// ========== 作业表 ==========

#[async_trait]
impl JobRepository for PgStore {
    async fn create_job(&self, job: &PipelineJob) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_jobs (
                job_id, question_paper_id, source_ref, status,
                discovered_roll_numbers, total_students, students_completed, students_failed,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.question_paper_id)
        .bind(&job.source_ref)
        .bind(job.status.as_str())
        .bind(&job.discovered_roll_numbers)
        .bind(job.total_students)
        .bind(job.students_completed)
        .bind(job.students_failed)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateJob {
                job_id: job.job_id.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> AppResult<Option<PipelineJob>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM pipeline_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PipelineJob::try_from).transpose()?)
    }

    async fn list_jobs(&self) -> AppResult<Vec<PipelineJob>> {
        let rows =
            sqlx::query_as::<_, JobRow>("SELECT * FROM pipeline_jobs ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| PipelineJob::try_from(row).map_err(AppError::from))
            .collect()
    }

    async fn mark_discovering(&self, job_id: &str, now: DateTime<Utc>) -> AppResult<PipelineJob> {
        self.modify_job(job_id, |job| {
            let restartable = job.status == JobStatus::Initiated
                || (job.status == JobStatus::Failed && job.total_students == 0);
            if !restartable {
                return Err(AppError::invalid_state(format!(
                    "作业 {} 状态为 {}，不能开始发现",
                    job.job_id, job.status
                )));
            }
            job.status = JobStatus::Discovering;
            job.discovery_started_at = Some(now);
            job.completed_at = None;
            job.error_message = None;
            job.updated_at = now;
            Ok(())
        })
        .await
    }

    async fn register_roster(
        &self,
        job_id: &str,
        entries: &[StudentQueueEntry],
        now: DateTime<Utc>,
    ) -> AppResult<PipelineJob> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        if job.status != JobStatus::Discovering {
            return Err(AppError::invalid_state(format!(
                "作业 {} 状态为 {}，不能登记名单",
                job_id, job.status
            )));
        }

        for entry in entries {
            let inserted = sqlx::query(
                r#"
                INSERT INTO student_queue (
                    id, job_id, question_paper_id, roll_number, current_stage, overall_status,
                    extract_status, chunk_status, map_status, grade_status,
                    retry_count, max_retries, priority, version, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT (job_id, roll_number) DO NOTHING
                "#,
            )
            .bind(entry.id)
            .bind(&entry.job_id)
            .bind(&entry.question_paper_id)
            .bind(&entry.roll_number)
            .bind(entry.current_stage.as_str())
            .bind(entry.overall_status.as_str())
            .bind(entry.extract.status.as_str())
            .bind(entry.chunk.status.as_str())
            .bind(entry.map.status.as_str())
            .bind(entry.grade.status.as_str())
            .bind(entry.retry_count)
            .bind(entry.max_retries)
            .bind(entry.priority)
            .bind(entry.version)
            .bind(entry.created_at)
            .bind(entry.updated_at)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                // 事务随 tx 被丢弃而回滚
                return Err(StoreError::DuplicateStudent {
                    job_id: entry.job_id.clone(),
                    roll_number: entry.roll_number.clone(),
                }
                .into());
            }
        }

        job.discovered_roll_numbers = entries.iter().map(|e| e.roll_number.clone()).collect();
        job.total_students = entries.len() as i32;
        job.discovery_completed_at = Some(now);
        job.status = JobStatus::Active;
        job.pipeline_started_at = Some(now);
        job.updated_at = now;
        Self::save_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn fail_job(
        &self,
        job_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> AppResult<PipelineJob> {
        let error = error.to_string();
        self.modify_job(job_id, move |job| {
            job.status = JobStatus::Failed;
            job.error_message = Some(error);
            job.completed_at = Some(now);
            job.updated_at = now;
            Ok(())
        })
        .await
    }

    async fn sync_student_counts(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<(PipelineJob, bool)> {
        let mut tx = self.pool.begin().await?;
        // 先锁作业行，并发的重算按顺序进行，最后一次看到的是全部已提交的条目
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        let (completed, failed): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE overall_status = 'completed'),
                COUNT(*) FILTER (WHERE overall_status = 'failed')
            FROM student_queue
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        let changed = job.sync_counts(completed as i32, failed as i32, now);
        if changed {
            Self::save_job(&mut tx, &job).await?;
        }
        tx.commit().await?;
        Ok((job, changed))
    }
}

// ========== 学生队列 ==========

#[async_trait]
impl StudentQueueRepository for PgStore {
    async fn find_pending(
        &self,
        stage: Stage,
        limit: usize,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<StudentQueueEntry>> {
        // 列名来自封闭的枚举，不会拼入外部输入
        let sql = format!(
            r#"
            SELECT * FROM student_queue
            WHERE {s}_status = 'pending'
              AND overall_status NOT IN ('completed', 'failed')
              AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
            ORDER BY priority DESC, created_at ASC, seq ASC
            LIMIT $2
            "#,
            s = stage.name()
        );
        let rows = sqlx::query_as::<_, StudentRow>(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        into_entries(rows)
    }

    async fn claim_for_processing(
        &self,
        entry_id: Uuid,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> AppResult<Option<StudentQueueEntry>> {
        let sql = format!(
            r#"
            UPDATE student_queue SET
                {s}_status = 'processing',
                {s}_started_at = $2,
                {s}_completed_at = NULL,
                current_stage = $3,
                overall_status = 'processing',
                next_attempt_at = NULL,
                updated_at = $2,
                version = version + 1
            WHERE id = $1
              AND {s}_status = 'pending'
              AND overall_status NOT IN ('completed', 'failed')
              AND (next_attempt_at IS NULL OR next_attempt_at <= $2)
            RETURNING *
            "#,
            s = stage.name()
        );
        let row = sqlx::query_as::<_, StudentRow>(&sql)
            .bind(entry_id)
            .bind(now)
            .bind(stage.processing_state().as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(StudentQueueEntry::try_from).transpose()?)
    }

    async fn update_entry(&self, entry: &StudentQueueEntry) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE student_queue SET
                current_stage = $3,
                overall_status = $4,
                extract_status = $5, extract_started_at = $6, extract_completed_at = $7,
                chunk_status = $8, chunk_started_at = $9, chunk_completed_at = $10,
                map_status = $11, map_started_at = $12, map_completed_at = $13,
                grade_status = $14, grade_started_at = $15, grade_completed_at = $16,
                retry_count = $17,
                max_retries = $18,
                priority = $19,
                error_message = $20,
                next_attempt_at = $21,
                updated_at = $22,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(entry.id)
        .bind(entry.version)
        .bind(entry.current_stage.as_str())
        .bind(entry.overall_status.as_str())
        .bind(entry.extract.status.as_str())
        .bind(entry.extract.started_at)
        .bind(entry.extract.completed_at)
        .bind(entry.chunk.status.as_str())
        .bind(entry.chunk.started_at)
        .bind(entry.chunk.completed_at)
        .bind(entry.map.status.as_str())
        .bind(entry.map.started_at)
        .bind(entry.map.completed_at)
        .bind(entry.grade.status.as_str())
        .bind(entry.grade.started_at)
        .bind(entry.grade.completed_at)
        .bind(entry.retry_count)
        .bind(entry.max_retries)
        .bind(entry.priority)
        .bind(&entry.error_message)
        .bind(entry.next_attempt_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM student_queue WHERE id = $1")
            .bind(entry.id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(AppError::not_found(format!("队列条目 {}", entry.id))),
        }
    }

    async fn get_entry(
        &self,
        job_id: &str,
        roll_number: &str,
    ) -> AppResult<Option<StudentQueueEntry>> {
        let row = sqlx::query_as::<_, StudentRow>(
            "SELECT * FROM student_queue WHERE job_id = $1 AND roll_number = $2",
        )
        .bind(job_id)
        .bind(roll_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(StudentQueueEntry::try_from).transpose()?)
    }

    async fn list_entries(&self, job_id: Option<&str>) -> AppResult<Vec<StudentQueueEntry>> {
        let rows = sqlx::query_as::<_, StudentRow>(
            r#"
            SELECT * FROM student_queue
            WHERE ($1::TEXT IS NULL OR job_id = $1)
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        into_entries(rows)
    }

    async fn find_stuck(
        &self,
        stage: Stage,
        started_before: DateTime<Utc>,
    ) -> AppResult<Vec<StudentQueueEntry>> {
        let sql = format!(
            r#"
            SELECT * FROM student_queue
            WHERE {s}_status = 'processing'
              AND ({s}_started_at IS NULL OR {s}_started_at < $1)
            ORDER BY seq ASC
            "#,
            s = stage.name()
        );
        let rows = sqlx::query_as::<_, StudentRow>(&sql)
            .bind(started_before)
            .fetch_all(&self.pool)
            .await?;
        into_entries(rows)
    }
}

// ========== 处理日志 ==========

#[async_trait]
impl ProcessingLogRepository for PgStore {
    async fn append_log(&self, entry: &ProcessingLogEntry) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processing_logs (
                id, student_entry_id, job_id, roll_number, stage, status,
                message, duration_seconds, timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.student_entry_id)
        .bind(&entry.job_id)
        .bind(&entry.roll_number)
        .bind(&entry.stage)
        .bind(&entry.status)
        .bind(&entry.message)
        .bind(entry.duration_seconds)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_logs(
        &self,
        job_id: &str,
        roll_number: &str,
        limit: usize,
    ) -> AppResult<Vec<ProcessingLogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT * FROM processing_logs
            WHERE job_id = $1 AND roll_number = $2
            ORDER BY timestamp DESC, seq DESC
            LIMIT $3
            "#,
        )
        .bind(job_id)
        .bind(roll_number)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProcessingLogEntry::from).collect())
    }

    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM processing_logs WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ========== 统计 ==========

#[async_trait]
impl MetricsRepository for PgStore {
    async fn upsert_metrics(&self, metrics: &PipelineMetrics) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_metrics (
                job_id, total_students, completed, failed, avg_total_time,
                avg_extract_time, avg_chunk_time, avg_map_time, avg_grade_time, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (job_id) DO UPDATE SET
                total_students = EXCLUDED.total_students,
                completed = EXCLUDED.completed,
                failed = EXCLUDED.failed,
                avg_total_time = EXCLUDED.avg_total_time,
                avg_extract_time = EXCLUDED.avg_extract_time,
                avg_chunk_time = EXCLUDED.avg_chunk_time,
                avg_map_time = EXCLUDED.avg_map_time,
                avg_grade_time = EXCLUDED.avg_grade_time,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&metrics.job_id)
        .bind(metrics.total_students)
        .bind(metrics.completed)
        .bind(metrics.failed)
        .bind(metrics.avg_total_time)
        .bind(metrics.avg_extract_time)
        .bind(metrics.avg_chunk_time)
        .bind(metrics.avg_map_time)
        .bind(metrics.avg_grade_time)
        .bind(metrics.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_metrics(&self, job_id: &str) -> AppResult<Option<PipelineMetrics>> {
        let row =
            sqlx::query_as::<_, MetricsRow>("SELECT * FROM pipeline_metrics WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(PipelineMetrics::from))
    }
}
