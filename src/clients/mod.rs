//! 外部服务客户端
//!
//! 核心只关心"成功 / 失败 / 能否重试"，不解释服务返回的内容。
//! 阶段服务自己保存产物，重复调用同一 (作业, 学号) 必须是安全的。

pub mod discovery_client;
pub mod http;
pub mod stage_client;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::models::{PipelineJob, Stage};
use crate::workflow::StudentCtx;

pub use discovery_client::HttpDiscoveryClient;
pub use stage_client::HttpStageClient;

/// 处理阶段（extract / chunk / map / grade）的调用接口
#[async_trait]
pub trait StageAdapter: Send + Sync {
    async fn run(&self, stage: Stage, ctx: &StudentCtx) -> Result<(), AdapterError>;
}

/// 学号发现服务
#[async_trait]
pub trait DiscoveryAdapter: Send + Sync {
    /// 返回服务识别出的原始学号列表（未清洗）
    async fn discover(&self, job: &PipelineJob) -> Result<Vec<String>, AdapterError>;
}
