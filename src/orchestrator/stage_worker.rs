//! 阶段 worker - 编排层
//!
//! ## 职责
//!
//! 每个处理阶段一个轮询循环：
//!
//! 1. 按空闲名额取出该阶段 `pending` 的条目（优先级降序，同优先级先进先出）
//! 2. 逐个认领（比较并交换），没抢到就跳过
//! 3. 每个认领到的条目占一个名额（`Semaphore`，共 `pool_size` 个），带超时调用外部服务
//! 4. 按结果做状态转换并按版本号写回
//! 5. 学生到达终态时重算作业计数，推进到下一阶段时唤醒下一个 worker
//!
//! 任一调用结束就释放名额，下一轮立刻补位，慢学生不会拖住整批。
//! 没有可派发的条目时，在轮询间隔、唤醒信号、调用结束和停止信号之间等待。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatcher::StageSignals;
use crate::clients::StageAdapter;
use crate::config::Config;
use crate::error::{AdapterError, AppResult};
use crate::models::{LogRef, LogStage, Stage, StudentQueueEntry};
use crate::services::{JobRegistry, ProcessingLog};
use crate::store::{PipelineStore, StudentQueueRepository};
use crate::utils::time::now;
use crate::utils::truncate_text;
use crate::workflow::{stage_machine, BackoffPolicy, StageFailure, StudentCtx, Transition};

/// 阶段 worker 配置
#[derive(Debug, Clone)]
pub struct StageWorkerConfig {
    /// 每次轮询取出的条目数
    pub batch_size: usize,
    /// 同时调用外部服务的数量
    pub pool_size: usize,
    /// 空闲时的轮询间隔
    pub poll_interval: Duration,
    /// 单次外部调用的超时
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl StageWorkerConfig {
    pub fn from_config(config: &Config, stage: Stage) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            pool_size: config.worker_pool_size.max(1),
            poll_interval: config.poll_interval(),
            timeout: config.stage_timeout(stage),
            backoff: BackoffPolicy::from_config(config),
        }
    }
}

/// 阶段 worker
pub struct StageWorker {
    stage: Stage,
    store: Arc<dyn PipelineStore>,
    adapter: Arc<dyn StageAdapter>,
    registry: JobRegistry,
    log: ProcessingLog,
    signals: Arc<StageSignals>,
    config: StageWorkerConfig,
}

impl StageWorker {
    pub fn new(
        stage: Stage,
        store: Arc<dyn PipelineStore>,
        adapter: Arc<dyn StageAdapter>,
        registry: JobRegistry,
        log: ProcessingLog,
        signals: Arc<StageSignals>,
        config: StageWorkerConfig,
    ) -> Self {
        Self {
            stage,
            store,
            adapter,
            registry,
            log,
            signals,
            config,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// 轮询循环，直到收到停止信号
    ///
    /// 收到停止信号后不再认领新条目，正在进行的外部调用会跑完。
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            stage = %self.stage,
            pool_size = self.config.pool_size,
            "▶ {} worker 启动",
            self.stage
        );

        let permits = Arc::new(Semaphore::new(self.config.pool_size));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        while !shutdown.is_cancelled() {
            while let Some(joined) = in_flight.try_join_next() {
                self.reap(joined);
            }

            let dispatched = match self.dispatch(&permits, &mut in_flight).await {
                Ok(n) => n,
                Err(e) => {
                    error!(stage = %self.stage, "❌ {} 轮询失败: {}", self.stage, e);
                    0
                }
            };

            if dispatched == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.signals.notified(self.stage) => {}
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => self.reap(joined),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        if !in_flight.is_empty() {
            info!(stage = %self.stage, count = in_flight.len(), "⏳ 等待 {} 进行中的调用结束", self.stage);
        }
        while let Some(joined) = in_flight.join_next().await {
            self.reap(joined);
        }
        info!(stage = %self.stage, "⏹ {} worker 已停止", self.stage);
    }

    /// 按空闲名额认领条目并派发，返回本轮派发数
    async fn dispatch(
        self: &Arc<Self>,
        permits: &Arc<Semaphore>,
        in_flight: &mut JoinSet<()>,
    ) -> AppResult<usize> {
        let free = permits.available_permits().min(self.config.batch_size);
        if free == 0 {
            return Ok(0);
        }
        let candidates = self.store.find_pending(self.stage, free, now()).await?;
        if candidates.is_empty() {
            return Ok(0);
        }
        debug!(stage = %self.stage, count = candidates.len(), free, "取出待处理条目");

        let mut dispatched = 0;
        for candidate in candidates {
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(entry) = self.claim(candidate).await else {
                continue;
            };
            let worker = self.clone();
            in_flight.spawn(async move {
                worker.process(entry).await;
                drop(permit);
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            error!(stage = %self.stage, "❌ {} 处理任务异常退出: {}", self.stage, e);
        }
    }

    /// 处理一批并等它全部结束：返回本批实际认领并处理的条目数
    ///
    /// 常驻循环用 [`run`](Self::run)；这里用于一次性排空和测试。
    pub async fn run_once(&self) -> AppResult<usize> {
        let batch = self
            .store
            .find_pending(self.stage, self.config.batch_size, now())
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }
        debug!(stage = %self.stage, count = batch.len(), "取出待处理条目");

        let processed = stream::iter(batch)
            .map(|entry| async move {
                match self.claim(entry).await {
                    Some(claimed) => {
                        self.process(claimed).await;
                        true
                    }
                    None => false,
                }
            })
            .buffer_unordered(self.config.pool_size)
            .filter(|claimed| futures::future::ready(*claimed))
            .count()
            .await;
        Ok(processed)
    }

    /// 认领一个条目；没抢到返回 None
    async fn claim(&self, candidate: StudentQueueEntry) -> Option<StudentQueueEntry> {
        match self
            .store
            .claim_for_processing(candidate.id, self.stage, now())
            .await
        {
            Ok(Some(entry)) => Some(entry),
            Ok(None) => {
                debug!(
                    "{} {} 已被其他 worker 认领，跳过",
                    StudentCtx::from(&candidate),
                    self.stage
                );
                None
            }
            Err(e) => {
                error!("{} 认领 {} 失败: {}", StudentCtx::from(&candidate), self.stage, e);
                None
            }
        }
    }

    /// 调用外部服务并写回结果（条目已处于 processing）
    pub async fn process(&self, mut entry: StudentQueueEntry) {
        let stage = self.stage;
        let ctx = StudentCtx::from(&entry);
        let target = LogRef::Entry {
            id: entry.id,
            job_id: entry.job_id.clone(),
            roll_number: entry.roll_number.clone(),
        };

        info!("{} ▶ {} 开始 (第 {} 次尝试)", ctx, stage, entry.retry_count + 1);
        self.log
            .append(
                target.clone(),
                LogStage::Stage(stage),
                "processing",
                format!("第 {} 次尝试", entry.retry_count + 1),
                None,
            )
            .await;

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.timeout, self.adapter.run(stage, &ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout {
                endpoint: stage.name().to_string(),
                timeout_secs: self.config.timeout.as_secs(),
            }),
        };
        let elapsed = started.elapsed().as_secs_f64();

        let ts = now();
        let transition = match &outcome {
            Ok(()) => stage_machine::complete(&mut entry, stage, ts),
            Err(e) => stage_machine::fail(
                &mut entry,
                stage,
                &StageFailure::from(e),
                &self.config.backoff,
                ts,
            ),
        };
        let transition = match transition {
            Ok(t) => t,
            Err(e) => {
                error!("{} {} 状态转换失败: {}", ctx, stage, e);
                return;
            }
        };

        match self.store.update_entry(&entry).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "{} ⚠️ 条目在 {} 调用期间被修改（监控回收或操作员干预），丢弃本次结果",
                    ctx, stage
                );
                self.log
                    .append(
                        target,
                        LogStage::Stage(stage),
                        "discarded",
                        "条目已被修改，结果未写回",
                        Some(elapsed),
                    )
                    .await;
                return;
            }
            Err(e) => {
                error!("{} ❌ 写回 {} 结果失败: {}", ctx, stage, e);
                return;
            }
        }

        let error_text = outcome
            .as_ref()
            .err()
            .map(|e| truncate_text(&e.to_string(), 300))
            .unwrap_or_default();

        match transition {
            Transition::Advanced { next } => {
                info!("{} ✓ {} 完成 ({:.1}秒)，进入 {}", ctx, stage, elapsed, next);
                self.log
                    .append(target, LogStage::Stage(stage), "completed", "", Some(elapsed))
                    .await;
                self.signals.trigger(next);
            }
            Transition::Finished => {
                info!("{} 🎓 全部阶段完成 ({:.1}秒)", ctx, elapsed);
                self.log
                    .append(target, LogStage::Stage(stage), "completed", "全部阶段完成", Some(elapsed))
                    .await;
                self.sync_job(&ctx).await;
            }
            Transition::Retrying { attempt, delay } => {
                warn!(
                    "{} ⚠️ {} 失败，{}秒后第 {} 次重试: {}",
                    ctx,
                    stage,
                    delay.as_secs(),
                    attempt,
                    error_text
                );
                self.log
                    .append(
                        target,
                        LogStage::Retry,
                        "retrying",
                        format!("{} 第 {} 次重试: {}", stage, attempt, error_text),
                        Some(elapsed),
                    )
                    .await;
            }
            Transition::Failed => {
                error!("{} ✗ {} 失败，不再重试: {}", ctx, stage, error_text);
                self.log
                    .append(target, LogStage::Stage(stage), "failed", error_text, Some(elapsed))
                    .await;
                self.sync_job(&ctx).await;
            }
            Transition::Claimed => {}
        }
    }

    /// 学生到达终态后重算作业计数；失败时由监控的对账补上
    async fn sync_job(&self, ctx: &StudentCtx) {
        if let Err(e) = self.registry.sync_counts(&ctx.job_id).await {
            error!("{} ❌ 更新作业计数失败，等待监控对账: {}", ctx, e);
        }
    }
}
