//! 发现 worker - 编排层
//!
//! 作业级任务，每个作业调用一次发现服务拿到学号名单，然后登记名单。
//! 这一步失败没有学生可排队，作业直接失败，不自动重试；操作员可重新发起。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::dispatcher::StageSignals;
use crate::clients::DiscoveryAdapter;
use crate::error::{AdapterError, AppResult};
use crate::models::{LogRef, LogStage, PipelineJob, Stage};
use crate::services::{JobRegistry, ProcessingLog};
use crate::utils::truncate_text;

/// 识别失败时发现服务用的占位学号前缀
const PLACEHOLDER_PREFIX: &str = "unknown_student";

/// 清洗发现服务返回的学号
///
/// 去掉首尾空白，丢弃空值、占位值和含非法字符的值，按首次出现去重。
/// 返回 (保留的学号, 被丢弃的原始值)。
pub fn sanitize_roll_numbers(raw: &[String]) -> AppResult<(Vec<String>, Vec<String>)> {
    let pattern = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_/\-]{0,63}$")?;
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut dropped = Vec::new();

    for value in raw {
        let roll = value.trim();
        if roll.is_empty()
            || roll.to_lowercase().starts_with(PLACEHOLDER_PREFIX)
            || !pattern.is_match(roll)
        {
            dropped.push(value.clone());
            continue;
        }
        if seen.insert(roll.to_string()) {
            kept.push(roll.to_string());
        }
    }
    Ok((kept, dropped))
}

/// 发现 worker
pub struct DiscoveryWorker {
    adapter: Arc<dyn DiscoveryAdapter>,
    registry: JobRegistry,
    log: ProcessingLog,
    signals: Arc<StageSignals>,
    timeout: Duration,
}

impl DiscoveryWorker {
    pub fn new(
        adapter: Arc<dyn DiscoveryAdapter>,
        registry: JobRegistry,
        log: ProcessingLog,
        signals: Arc<StageSignals>,
        timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            registry,
            log,
            signals,
            timeout,
        }
    }

    /// 在后台运行发现
    pub fn spawn(self: Arc<Self>, job_id: String) -> JoinHandle<AppResult<PipelineJob>> {
        tokio::spawn(async move {
            let result = self.run(&job_id).await;
            if let Err(e) = &result {
                warn!("⚠️ 作业 {} 未能开始发现: {}", job_id, e);
            }
            result
        })
    }

    /// 在后台继续一个已进入 discovering 的作业
    pub fn spawn_discovering(self: Arc<Self>, job: PipelineJob) -> JoinHandle<AppResult<PipelineJob>> {
        tokio::spawn(async move { self.execute(job).await })
    }

    /// 运行一次发现
    ///
    /// 作业不处于可发现状态时返回错误；发现本身失败时作业被标记为 failed，
    /// 并返回失败后的作业。
    pub async fn run(&self, job_id: &str) -> AppResult<PipelineJob> {
        let job = self.registry.begin_discovery(job_id).await?;
        self.execute(job).await
    }

    async fn execute(&self, job: PipelineJob) -> AppResult<PipelineJob> {
        let job_id = job.job_id.as_str();
        info!("🔍 作业 {} 开始发现学号 (来源: {})", job_id, job.source_ref.as_deref().unwrap_or("-"));
        self.log
            .append(LogRef::Job(job_id.to_string()), LogStage::Discovery, "processing", "", None)
            .await;

        let started = Instant::now();
        let roster = match self.discover(&job).await {
            Ok(roster) => roster,
            Err(message) => {
                let elapsed = started.elapsed().as_secs_f64();
                return self.fail(job_id, &message, elapsed).await;
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        match self.registry.register_discovery(job_id, &roster).await {
            Ok(job) => {
                self.log
                    .append(
                        LogRef::Job(job_id.to_string()),
                        LogStage::Discovery,
                        "completed",
                        format!("发现 {} 名学生", job.total_students),
                        Some(elapsed),
                    )
                    .await;
                self.signals.trigger(Stage::Extract);
                Ok(job)
            }
            Err(e) => self.fail(job_id, &e.to_string(), elapsed).await,
        }
    }

    /// 调用发现服务并清洗结果；失败时返回错误描述
    async fn discover(&self, job: &PipelineJob) -> Result<Vec<String>, String> {
        let raw = match tokio::time::timeout(self.timeout, self.adapter.discover(job)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => {
                return Err(AdapterError::Timeout {
                    endpoint: "discovery".to_string(),
                    timeout_secs: self.timeout.as_secs(),
                }
                .to_string())
            }
        };

        let (roster, dropped) = sanitize_roll_numbers(&raw).map_err(|e| e.to_string())?;
        if !dropped.is_empty() {
            warn!(
                "⚠️ 作业 {} 丢弃 {} 个无效学号: {:?}",
                job.job_id,
                dropped.len(),
                dropped
            );
        }
        if roster.is_empty() {
            return Err(format!("发现服务没有返回有效学号 (原始 {} 个)", raw.len()));
        }
        Ok(roster)
    }

    async fn fail(&self, job_id: &str, message: &str, elapsed: f64) -> AppResult<PipelineJob> {
        let message = truncate_text(message, 500);
        error!("❌ 作业 {} 发现失败: {}", job_id, message);
        self.log
            .append(
                LogRef::Job(job_id.to_string()),
                LogStage::Discovery,
                "failed",
                message.clone(),
                Some(elapsed),
            )
            .await;
        self.registry.fail_discovery(job_id, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sanitize_trims_and_dedupes() {
        let (kept, dropped) =
            sanitize_roll_numbers(&strings(&[" 1", "2", "1 ", "", "CS-2024/07"])).unwrap();
        assert_eq!(kept, vec!["1", "2", "CS-2024/07"]);
        assert_eq!(dropped, vec![""]);
    }

    #[test]
    fn test_sanitize_drops_placeholders_and_garbage() {
        let (kept, dropped) = sanitize_roll_numbers(&strings(&[
            "Unknown_Student_3",
            "NOT FOUND",
            "12;DROP",
            "42",
        ]))
        .unwrap();
        assert_eq!(kept, vec!["42"]);
        assert_eq!(dropped.len(), 3);
    }
}
