//! 调度器 - 编排层
//!
//! 进程启动时构造一次，持有四个阶段的 worker 和它们的任务句柄。
//! 各阶段的 worker 池互不依赖，某个池退出不影响其他池。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::stage_worker::StageWorker;
use crate::models::Stage;

/// 每个阶段一个唤醒信号
///
/// 条目进入某阶段的 pending 时触发，worker 不必等满轮询间隔。
#[derive(Debug, Default)]
pub struct StageSignals {
    notifies: [Notify; 4],
}

impl StageSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, stage: Stage) {
        self.notifies[stage.index()].notify_one();
    }

    pub fn notified(&self, stage: Stage) -> Notified<'_> {
        self.notifies[stage.index()].notified()
    }
}

struct PoolHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PoolHandle {
    fn is_running(&self) -> bool {
        !self.handle.is_finished() && !self.token.is_cancelled()
    }
}

/// 调度器
pub struct Dispatcher {
    workers: HashMap<Stage, Arc<StageWorker>>,
    pools: Mutex<HashMap<Stage, PoolHandle>>,
    /// 已取消、可能还在处理最后一批的旧池
    retired: Mutex<Vec<(Stage, JoinHandle<()>)>>,
    signals: Arc<StageSignals>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        workers: Vec<Arc<StageWorker>>,
        signals: Arc<StageSignals>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            workers: workers.into_iter().map(|w| (w.stage(), w)).collect(),
            pools: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            signals,
            shutdown,
        }
    }

    pub fn signals(&self) -> Arc<StageSignals> {
        self.signals.clone()
    }

    /// 唤醒某阶段的 worker
    pub fn trigger(&self, stage: Stage) {
        self.signals.trigger(stage);
    }

    /// 启动所有没在运行的 worker 池，返回本次启动的阶段
    ///
    /// 已在运行的池保持不变，重复调用没有副作用。
    pub async fn ensure_workers_running(&self) -> Vec<Stage> {
        if self.shutdown.is_cancelled() {
            return Vec::new();
        }

        let mut pools = self.pools.lock().await;
        let mut started = Vec::new();
        for stage in Stage::ALL {
            if pools.get(&stage).is_some_and(PoolHandle::is_running) {
                continue;
            }
            let Some(worker) = self.workers.get(&stage) else {
                warn!("⚠️ 阶段 {} 没有配置 worker", stage);
                continue;
            };
            if pools.contains_key(&stage) {
                warn!("⚠️ {} worker 池已停止，重新启动", stage);
            }
            let token = self.shutdown.child_token();
            let handle = tokio::spawn(worker.clone().run(token.clone()));
            pools.insert(stage, PoolHandle { token, handle });
            started.push(stage);
        }
        started
    }

    /// 重启全部 worker 池
    ///
    /// 旧的池处理完手上这一批后退出；认领是比较并交换，新旧池不会重复处理同一条目。
    pub async fn restart_workers(&self) -> Vec<Stage> {
        {
            let mut pools = self.pools.lock().await;
            let mut retired = self.retired.lock().await;
            retired.retain(|(_, handle)| !handle.is_finished());
            for (stage, pool) in pools.drain() {
                pool.token.cancel();
                info!("🔄 {} worker 池停止中", stage);
                retired.push((stage, pool.handle));
            }
        }
        let started = self.ensure_workers_running().await;
        for stage in &started {
            self.signals.trigger(*stage);
        }
        started
    }

    /// 各阶段 worker 池是否在运行
    pub async fn pool_states(&self) -> Vec<(Stage, bool)> {
        let pools = self.pools.lock().await;
        Stage::ALL
            .into_iter()
            .map(|stage| (stage, pools.get(&stage).is_some_and(PoolHandle::is_running)))
            .collect()
    }

    /// 停止所有 worker（包括重启前的旧池）并等待它们退出
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut handles: Vec<(Stage, JoinHandle<()>)> = self
            .pools
            .lock()
            .await
            .drain()
            .map(|(stage, pool)| (stage, pool.handle))
            .collect();
        handles.append(&mut *self.retired.lock().await);
        for (stage, handle) in handles {
            if let Err(e) = handle.await {
                warn!("⚠️ {} worker 退出异常: {}", stage, e);
            }
        }
        info!("⏹ 所有 worker 已停止");
    }

    /// 重启后还没退出的旧池数量
    pub async fn retired_running(&self) -> usize {
        self.retired
            .lock()
            .await
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::clients::StageAdapter;
    use crate::error::AdapterError;
    use crate::orchestrator::stage_worker::StageWorkerConfig;
    use crate::services::{JobRegistry, ProcessingLog};
    use crate::store::{MemoryStore, PipelineStore};
    use crate::workflow::{BackoffPolicy, StudentCtx};

    struct Noop;

    #[async_trait]
    impl StageAdapter for Noop {
        async fn run(&self, _stage: Stage, _ctx: &StudentCtx) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        let store: Arc<dyn PipelineStore> = Arc::new(MemoryStore::new());
        let signals = Arc::new(StageSignals::new());
        let workers = Stage::ALL
            .into_iter()
            .map(|stage| {
                Arc::new(StageWorker::new(
                    stage,
                    store.clone(),
                    Arc::new(Noop),
                    JobRegistry::new(store.clone(), 3),
                    ProcessingLog::new(store.clone()),
                    signals.clone(),
                    StageWorkerConfig {
                        batch_size: 10,
                        pool_size: 2,
                        poll_interval: Duration::from_millis(10),
                        timeout: Duration::from_secs(1),
                        backoff: BackoffPolicy::none(),
                    },
                ))
            })
            .collect();
        Dispatcher::new(workers, signals, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_ensure_workers_running_is_idempotent() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.ensure_workers_running().await, Stage::ALL.to_vec());
        assert!(dispatcher.ensure_workers_running().await.is_empty());
        assert!(dispatcher.pool_states().await.iter().all(|(_, running)| *running));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_replaces_pools_and_shutdown_awaits_old_ones() {
        let dispatcher = dispatcher();
        dispatcher.ensure_workers_running().await;

        assert_eq!(dispatcher.restart_workers().await, Stage::ALL.to_vec());
        assert!(dispatcher.pool_states().await.iter().all(|(_, running)| *running));
        assert!(dispatcher.ensure_workers_running().await.is_empty());

        dispatcher.shutdown().await;
        assert_eq!(dispatcher.retired_running().await, 0);
        assert!(dispatcher.retired.lock().await.is_empty());
        assert!(dispatcher.pool_states().await.iter().all(|(_, running)| !*running));
    }

    #[tokio::test]
    async fn test_no_pools_start_after_shutdown() {
        let dispatcher = dispatcher();
        dispatcher.shutdown().await;
        assert!(dispatcher.ensure_workers_running().await.is_empty());
        assert!(dispatcher.restart_workers().await.is_empty());
    }
}
