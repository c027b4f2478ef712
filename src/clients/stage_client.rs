/// 阶段服务客户端
///
/// 四个处理阶段各对应一个 HTTP 接口，请求体只带学号、试卷 ID 和阶段参数。
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::http::{build_client, post_json};
use super::StageAdapter;
use crate::config::Config;
use crate::error::{AdapterError, AppError, AppResult};
use crate::models::Stage;
use crate::workflow::StudentCtx;

/// 阶段服务客户端
pub struct HttpStageClient {
    client: reqwest::Client,
    extract_url: String,
    chunk_url: String,
    map_url: String,
    grade_url: String,
    max_chunk_size: u32,
    top_k: u32,
    grading_mode: String,
}

impl HttpStageClient {
    /// 创建新的阶段服务客户端
    pub fn new(config: &Config) -> AppResult<Self> {
        let client = build_client().map_err(AppError::from)?;
        Ok(Self {
            client,
            extract_url: config.extract_url.trim_end_matches('/').to_string(),
            chunk_url: config.chunk_url.clone(),
            map_url: config.map_url.clone(),
            grade_url: config.grade_url.clone(),
            max_chunk_size: config.max_chunk_size,
            top_k: config.top_k,
            grading_mode: config.grading_mode.clone(),
        })
    }

    /// 某阶段的请求地址与请求体
    ///
    /// extract 把学号和试卷 ID 放在路径里，其余阶段放在请求体里。
    pub fn request_for(&self, stage: Stage, ctx: &StudentCtx) -> (String, Value) {
        match stage {
            Stage::Extract => (
                format!(
                    "{}/{}/uuid/{}",
                    self.extract_url, ctx.roll_number, ctx.question_paper_id
                ),
                json!({
                    "word_level": false,
                    "process_all": true,
                    "include_metadata": true
                }),
            ),
            Stage::Chunk => (
                self.chunk_url.clone(),
                json!({
                    "question_paper_uuid": ctx.question_paper_id,
                    "roll_no": ctx.roll_number,
                    "max_chunk_size": self.max_chunk_size
                }),
            ),
            Stage::Map => (
                self.map_url.clone(),
                json!({
                    "roll_no": ctx.roll_number,
                    "question_paper_uuid": ctx.question_paper_id,
                    "top_k": self.top_k
                }),
            ),
            Stage::Grade => (
                self.grade_url.clone(),
                json!({
                    "roll_no": ctx.roll_number,
                    "question_paper_uuid": ctx.question_paper_id,
                    "grading_type": self.grading_mode
                }),
            ),
        }
    }
}

#[async_trait]
impl StageAdapter for HttpStageClient {
    async fn run(&self, stage: Stage, ctx: &StudentCtx) -> Result<(), AdapterError> {
        let (url, payload) = self.request_for(stage, ctx);
        let body = post_json(&self.client, stage.name(), &url, &payload).await?;
        debug!("{} {} 响应: {}", ctx, stage, body);
        Ok(())
    }
}
