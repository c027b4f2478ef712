//! 应用 - 编排层
//!
//! ## 职责
//!
//! 1. **组装**：按配置选择队列存储（Postgres / 内存），构造四个阶段 worker、
//!    发现 worker、调度器、监控和控制接口
//! 2. **运行**：启动 worker 池和监控；配置了 `question_paper_id` 时直接跑完一个作业
//!    并输出统计，否则常驻直到 Ctrl-C
//! 3. **停止**：通知所有任务退出并等待 worker 跑完手上的批次

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::discovery_worker::DiscoveryWorker;
use super::dispatcher::{Dispatcher, StageSignals};
use super::monitor::{Monitor, MonitorConfig};
use super::stage_worker::{StageWorker, StageWorkerConfig};
use crate::clients::{DiscoveryAdapter, HttpDiscoveryClient, HttpStageClient, StageAdapter};
use crate::config::Config;
use crate::control::{ControlResponse, ControlSurface, StartJobRequest};
use crate::error::{AppError, AppResult};
use crate::models::{PipelineJob, Stage};
use crate::services::{JobRegistry, MetricsAggregator, ProcessingLog};
use crate::store::{MemoryStore, PgStore, PipelineStore};
use crate::utils::logging::{log_startup, print_final_stats};

/// 应用主结构
pub struct App {
    config: Config,
    store: Arc<dyn PipelineStore>,
    registry: JobRegistry,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<Monitor>,
    control: ControlSurface,
    shutdown: CancellationToken,
    monitor_handle: Option<JoinHandle<()>>,
}

impl App {
    /// 按配置初始化应用，外部服务走 HTTP
    pub async fn initialize(config: Config) -> AppResult<Self> {
        let store: Arc<dyn PipelineStore> = match config.database_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                let max_connections = (config.worker_pool_size * Stage::ALL.len() + 4) as u32;
                Arc::new(PgStore::connect(url, max_connections).await?)
            }
            _ => {
                warn!("⚠️ 未配置 database_url，使用内存队列（进程退出后数据丢失）");
                Arc::new(MemoryStore::new())
            }
        };
        let stage_adapter = Arc::new(HttpStageClient::new(&config)?);
        let discovery_adapter = Arc::new(HttpDiscoveryClient::new(&config)?);
        Ok(Self::with_adapters(config, store, stage_adapter, discovery_adapter))
    }

    /// 用给定的存储和外部服务组装应用
    pub fn with_adapters(
        config: Config,
        store: Arc<dyn PipelineStore>,
        stage_adapter: Arc<dyn StageAdapter>,
        discovery_adapter: Arc<dyn DiscoveryAdapter>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let signals = Arc::new(StageSignals::new());
        let registry = JobRegistry::new(store.clone(), config.max_retries);
        let log = ProcessingLog::new(store.clone());
        let metrics = MetricsAggregator::new(store.clone());

        let workers = Stage::ALL
            .into_iter()
            .map(|stage| {
                Arc::new(StageWorker::new(
                    stage,
                    store.clone(),
                    stage_adapter.clone(),
                    registry.clone(),
                    log.clone(),
                    signals.clone(),
                    StageWorkerConfig::from_config(&config, stage),
                ))
            })
            .collect();
        let dispatcher = Arc::new(Dispatcher::new(workers, signals.clone(), shutdown.clone()));

        let discovery = Arc::new(DiscoveryWorker::new(
            discovery_adapter,
            registry.clone(),
            log.clone(),
            signals,
            config.discovery_timeout(),
        ));

        let monitor = Arc::new(Monitor::new(
            store.clone(),
            dispatcher.clone(),
            registry.clone(),
            metrics.clone(),
            log.clone(),
            MonitorConfig::from_config(&config),
        ));

        let control = ControlSurface::new(
            store.clone(),
            registry.clone(),
            log,
            metrics,
            dispatcher.clone(),
            discovery,
        );

        Self {
            config,
            store,
            registry,
            dispatcher,
            monitor,
            control,
            shutdown,
            monitor_handle: None,
        }
    }

    pub fn control(&self) -> &ControlSurface {
        &self.control
    }

    pub fn store(&self) -> Arc<dyn PipelineStore> {
        self.store.clone()
    }

    /// 启动 worker 池和监控
    pub async fn start(&mut self) {
        let started = self.dispatcher.ensure_workers_running().await;
        info!("⚙️ 已启动 worker 池: {:?}", started);
        if self.monitor_handle.is_none() {
            let monitor = self.monitor.clone();
            let token = self.shutdown.child_token();
            self.monitor_handle = Some(tokio::spawn(monitor.run(token)));
        }
    }

    /// 运行应用主逻辑
    pub async fn run(mut self) -> AppResult<()> {
        log_startup(&self.config);
        self.start().await;

        let result = match self.config.question_paper_id.clone() {
            Some(question_paper_id) => self.run_single_job(question_paper_id).await.map(|_| ()),
            None => {
                info!("🟢 流水线已就绪，按 Ctrl-C 退出");
                wait_for_ctrl_c().await;
                Ok(())
            }
        };

        self.shutdown().await;
        result
    }

    /// 批处理模式：启动一个作业并等待它结束
    async fn run_single_job(&self, question_paper_id: String) -> AppResult<PipelineJob> {
        let request = StartJobRequest {
            job_id: self.config.job_id.clone(),
            question_paper_id,
            source_ref: self.config.source_ref.clone(),
        };
        let job_id = match self.control.start_job(request).await {
            ControlResponse::Success { data } => data.job_id,
            ControlResponse::NotFound { message }
            | ControlResponse::InvalidState { message }
            | ControlResponse::Error { message } => {
                error!("❌ 作业启动失败: {}", message);
                return Err(AppError::Other(message));
            }
        };
        info!("▶️ 作业 {} 已启动", job_id);

        let mut tick = tokio::time::interval(self.config.poll_interval());
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = wait_for_ctrl_c() => {
                    warn!("⏹ 收到 Ctrl-C，作业 {} 未结束", job_id);
                    return self.registry.get_job(&job_id).await;
                }
            }
            let job = self.registry.get_job(&job_id).await?;
            if job.status.is_terminal() {
                print_final_stats(&job);
                return Ok(job);
            }
        }
    }

    /// 停止所有任务
    pub async fn shutdown(&mut self) {
        info!("⏹ 正在停止...");
        self.shutdown.cancel();
        self.dispatcher.shutdown().await;
        if let Some(handle) = self.monitor_handle.take() {
            if let Err(e) = handle.await {
                warn!("⚠️ 监控退出异常: {}", e);
            }
        }
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ 无法监听 Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
