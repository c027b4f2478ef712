//! 处理日志服务 - 业务能力层
//!
//! 只负责"记一笔"，写失败不影响状态转换

use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::models::{LogRef, LogStage, ProcessingLogEntry};
use crate::store::{PipelineStore, ProcessingLogRepository};
use crate::utils::time::now;

/// 处理日志服务
///
/// 职责：
/// - 每次状态转换追加一条审计记录
/// - 按学生查询最近的记录
/// - 清理过期记录
#[derive(Clone)]
pub struct ProcessingLog {
    store: Arc<dyn PipelineStore>,
}

impl ProcessingLog {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// 追加一条日志
    ///
    /// 写入失败只打警告，调用方的状态转换照常进行。
    pub async fn append(
        &self,
        target: LogRef,
        stage: LogStage,
        status: &str,
        message: impl Into<String>,
        duration_seconds: Option<f64>,
    ) {
        let entry = ProcessingLogEntry::new(target, stage, status, message, duration_seconds, now());
        if let Err(e) = self.store.append_log(&entry).await {
            warn!(
                "⚠️ 写处理日志失败 ({} {} {}): {}",
                entry.job_id.as_deref().unwrap_or("-"),
                entry.roll_number.as_deref().unwrap_or("-"),
                entry.stage,
                e
            );
        }
    }

    /// 某学生最新的若干条日志
    pub async fn recent(
        &self,
        job_id: &str,
        roll_number: &str,
        limit: usize,
    ) -> AppResult<Vec<ProcessingLogEntry>> {
        self.store.recent_logs(job_id, roll_number, limit).await
    }

    /// 删除超过保留天数的日志
    pub async fn cleanup_old_logs(&self, retention_days: i64) -> AppResult<u64> {
        let cutoff = now() - Duration::days(retention_days);
        let removed = self.store.purge_logs_before(cutoff).await?;
        if removed > 0 {
            info!("🧹 已清理 {} 条超过 {} 天的处理日志", removed, retention_days);
        }
        Ok(removed)
    }
}
