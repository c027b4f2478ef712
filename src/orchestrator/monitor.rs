//! 监控 - 编排层
//!
//! ## 职责
//!
//! 1. **统计**：每隔 `metrics_interval` 重算进行中作业的统计
//! 2. **卡死回收**：同一节拍里，把 processing 超过"阶段超时 + 宽限"的条目
//!    按瞬时失败处理（消耗一次重试）
//! 3. **对账**：同一节拍里，按学生条目重算进行中作业的计数
//! 4. **存活检查**：每隔 `liveness_interval` 启动没在运行的 worker 池，
//!    并清理过期的处理日志

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::dispatcher::Dispatcher;
use crate::config::Config;
use crate::error::AppResult;
use crate::models::{LogRef, LogStage, Stage};
use crate::services::{JobRegistry, MetricsAggregator, ProcessingLog};
use crate::store::{PipelineStore, StudentQueueRepository};
use crate::utils::time::now;
use crate::workflow::{stage_machine, BackoffPolicy, StageFailure, StudentCtx, Transition};

/// 监控配置
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub metrics_interval: Duration,
    pub liveness_interval: Duration,
    pub stuck_grace: Duration,
    pub stage_timeouts: [Duration; 4],
    pub log_retention_days: i64,
    pub backoff: BackoffPolicy,
}

impl MonitorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            metrics_interval: Duration::from_secs(config.metrics_interval_secs.max(1)),
            liveness_interval: Duration::from_secs(config.liveness_interval_secs.max(1)),
            stuck_grace: Duration::from_secs(config.stuck_grace_secs),
            stage_timeouts: Stage::ALL.map(|stage| config.stage_timeout(stage)),
            log_retention_days: config.log_retention_days,
            backoff: BackoffPolicy::from_config(config),
        }
    }
}

/// 监控
pub struct Monitor {
    store: Arc<dyn PipelineStore>,
    dispatcher: Arc<Dispatcher>,
    registry: JobRegistry,
    metrics: MetricsAggregator,
    log: ProcessingLog,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        dispatcher: Arc<Dispatcher>,
        registry: JobRegistry,
        metrics: MetricsAggregator,
        log: ProcessingLog,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            registry,
            metrics,
            log,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut metrics_tick = tokio::time::interval(self.config.metrics_interval);
        let mut liveness_tick = tokio::time::interval(self.config.liveness_interval);
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        liveness_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 跳过立即触发的第一拍
        metrics_tick.tick().await;
        liveness_tick.tick().await;

        info!("🩺 监控启动");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = metrics_tick.tick() => {
                    if let Err(e) = self.reclaim_stuck().await {
                        error!("❌ 卡死回收失败: {}", e);
                    }
                    if let Err(e) = self.registry.reconcile_active_jobs().await {
                        error!("❌ 作业计数对账失败: {}", e);
                    }
                    if let Err(e) = self.metrics.recompute_all().await {
                        error!("❌ 统计重算失败: {}", e);
                    }
                }
                _ = liveness_tick.tick() => {
                    self.check_liveness().await;
                    if let Err(e) = self.log.cleanup_old_logs(self.config.log_retention_days).await {
                        error!("❌ 清理处理日志失败: {}", e);
                    }
                }
            }
        }
        info!("⏹ 监控已停止");
    }

    /// 启动没在运行的 worker 池
    pub async fn check_liveness(&self) -> Vec<Stage> {
        let restarted = self.dispatcher.ensure_workers_running().await;
        if !restarted.is_empty() {
            warn!("🩺 存活检查重新启动了 worker 池: {:?}", restarted);
        }
        restarted
    }

    /// 回收卡死的条目，返回回收数
    pub async fn reclaim_stuck(&self) -> AppResult<usize> {
        let mut reclaimed = 0;
        for stage in Stage::ALL {
            let window = self.config.stage_timeouts[stage.index()] + self.config.stuck_grace;
            let cutoff = now()
                - chrono::Duration::from_std(window)
                    .unwrap_or_else(|_| chrono::Duration::days(365));

            for mut entry in self.store.find_stuck(stage, cutoff).await? {
                let ctx = StudentCtx::from(&entry);
                let failure = StageFailure::transient(format!(
                    "{} 处理超过 {} 秒没有结果",
                    stage,
                    window.as_secs()
                ));
                let transition =
                    match stage_machine::fail(&mut entry, stage, &failure, &self.config.backoff, now()) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("{} 回收 {} 跳过: {}", ctx, stage, e);
                            continue;
                        }
                    };
                if !self.store.update_entry(&entry).await? {
                    // worker 刚好写回了结果
                    continue;
                }
                reclaimed += 1;

                warn!("{} 🩺 {} 卡死，已回收 ({})", ctx, stage, transition.label());
                self.log
                    .append(
                        LogRef::Entry {
                            id: entry.id,
                            job_id: entry.job_id.clone(),
                            roll_number: entry.roll_number.clone(),
                        },
                        LogStage::Monitor,
                        transition.label(),
                        failure.message.clone(),
                        None,
                    )
                    .await;

                match transition {
                    Transition::Failed => {
                        if let Err(e) = self.registry.sync_counts(&entry.job_id).await {
                            error!("{} ❌ 更新作业计数失败，下次对账补上: {}", ctx, e);
                        }
                    }
                    Transition::Retrying { .. } => self.dispatcher.trigger(stage),
                    _ => {}
                }
            }
        }
        if reclaimed > 0 {
            info!("🩺 本轮回收 {} 个卡死条目", reclaimed);
        }
        Ok(reclaimed)
    }
}
