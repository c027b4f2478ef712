use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppResult, ConfigError};
use crate::models::Stage;

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Postgres 连接串；为空时使用内存队列
    pub database_url: Option<String>,
    /// 是否显示详细日志
    pub verbose_logging: bool,

    // --- 外部阶段服务地址 ---
    pub discovery_url: String,
    pub extract_url: String,
    pub chunk_url: String,
    pub map_url: String,
    pub grade_url: String,

    // --- 各阶段超时（秒） ---
    pub discovery_timeout_secs: u64,
    pub extract_timeout_secs: u64,
    pub chunk_timeout_secs: u64,
    pub map_timeout_secs: u64,
    pub grade_timeout_secs: u64,

    // --- 工作池 ---
    /// 每个阶段同时调用外部服务的数量
    pub worker_pool_size: usize,
    /// 每次轮询取出的待处理条目数
    pub batch_size: usize,
    /// 没有任务时的轮询间隔（毫秒）
    pub poll_interval_ms: u64,

    // --- 重试 ---
    pub max_retries: i32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,

    // --- 监控 ---
    pub metrics_interval_secs: u64,
    pub liveness_interval_secs: u64,
    /// 超过阶段超时多久仍在 processing 视为卡死
    pub stuck_grace_secs: u64,
    pub log_retention_days: i64,

    // --- 阶段参数 ---
    pub max_chunk_size: u32,
    pub top_k: u32,
    pub grading_mode: String,
    pub crop_percentage: f64,

    // --- 批处理模式：启动后直接跑一个作业 ---
    pub question_paper_id: Option<String>,
    pub source_ref: Option<String>,
    pub job_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            verbose_logging: false,
            discovery_url: "http://localhost:5000/process-stamps".to_string(),
            extract_url: "http://localhost:5001/ocr/roll".to_string(),
            chunk_url: "http://localhost:5002/process-ocr-chunks".to_string(),
            map_url: "http://127.0.0.1:5003/api/qa-mapping".to_string(),
            grade_url: "http://localhost:5007/grade".to_string(),
            discovery_timeout_secs: 600,
            extract_timeout_secs: 300,
            chunk_timeout_secs: 300,
            map_timeout_secs: 300,
            grade_timeout_secs: 300,
            worker_pool_size: 4,
            batch_size: 10,
            poll_interval_ms: 2000,
            max_retries: 3,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            metrics_interval_secs: 300,
            liveness_interval_secs: 600,
            stuck_grace_secs: 60,
            log_retention_days: 30,
            max_chunk_size: 1500,
            top_k: 3,
            grading_mode: "Very Liberal".to_string(),
            crop_percentage: 0.2,
            question_paper_id: None,
            source_ref: None,
            job_id: None,
        }
    }
}

impl Config {
    /// 只从环境变量读取配置
    pub fn from_env() -> AppResult<Self> {
        Self::default().apply_env()
    }

    /// 读取 `PIPELINE_CONFIG` 指向的 TOML 文件（可选），再用环境变量覆盖
    pub fn load() -> AppResult<Self> {
        let base = match std::env::var("PIPELINE_CONFIG") {
            Ok(path) => Self::from_toml_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        base.apply_env()
    }

    /// 从 TOML 文件读取配置，缺省字段使用默认值
    pub fn from_toml_file(path: &Path) -> AppResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadFailed {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    pub fn from_toml_str(content: &str, origin: &str) -> AppResult<Self> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::TomlParseFailed {
            path: origin.to_string(),
            source,
        })?;
        Ok(config)
    }

    fn apply_env(self) -> AppResult<Self> {
        Ok(Self {
            database_url: env_opt("DATABASE_URL").or(self.database_url),
            verbose_logging: env_or("VERBOSE_LOGGING", self.verbose_logging)?,
            discovery_url: env_or("DISCOVERY_URL", self.discovery_url)?,
            extract_url: env_or("EXTRACT_URL", self.extract_url)?,
            chunk_url: env_or("CHUNK_URL", self.chunk_url)?,
            map_url: env_or("MAP_URL", self.map_url)?,
            grade_url: env_or("GRADE_URL", self.grade_url)?,
            discovery_timeout_secs: env_or("DISCOVERY_TIMEOUT_SECS", self.discovery_timeout_secs)?,
            extract_timeout_secs: env_or("EXTRACT_TIMEOUT_SECS", self.extract_timeout_secs)?,
            chunk_timeout_secs: env_or("CHUNK_TIMEOUT_SECS", self.chunk_timeout_secs)?,
            map_timeout_secs: env_or("MAP_TIMEOUT_SECS", self.map_timeout_secs)?,
            grade_timeout_secs: env_or("GRADE_TIMEOUT_SECS", self.grade_timeout_secs)?,
            worker_pool_size: env_or("WORKER_POOL_SIZE", self.worker_pool_size)?,
            batch_size: env_or("BATCH_SIZE", self.batch_size)?,
            poll_interval_ms: env_or("POLL_INTERVAL_MS", self.poll_interval_ms)?,
            max_retries: env_or("MAX_RETRIES", self.max_retries)?,
            backoff_base_secs: env_or("BACKOFF_BASE_SECS", self.backoff_base_secs)?,
            backoff_max_secs: env_or("BACKOFF_MAX_SECS", self.backoff_max_secs)?,
            metrics_interval_secs: env_or("METRICS_INTERVAL_SECS", self.metrics_interval_secs)?,
            liveness_interval_secs: env_or("LIVENESS_INTERVAL_SECS", self.liveness_interval_secs)?,
            stuck_grace_secs: env_or("STUCK_GRACE_SECS", self.stuck_grace_secs)?,
            log_retention_days: env_or("LOG_RETENTION_DAYS", self.log_retention_days)?,
            max_chunk_size: env_or("MAX_CHUNK_SIZE", self.max_chunk_size)?,
            top_k: env_or("TOP_K", self.top_k)?,
            grading_mode: env_or("GRADING_MODE", self.grading_mode)?,
            crop_percentage: env_or("CROP_PERCENTAGE", self.crop_percentage)?,
            question_paper_id: env_opt("QUESTION_PAPER_ID").or(self.question_paper_id),
            source_ref: env_opt("SOURCE_REF").or(self.source_ref),
            job_id: env_opt("JOB_ID").or(self.job_id),
        })
    }

    /// 阶段服务地址
    pub fn stage_url(&self, stage: Stage) -> &str {
        match stage {
            Stage::Extract => &self.extract_url,
            Stage::Chunk => &self.chunk_url,
            Stage::Map => &self.map_url,
            Stage::Grade => &self.grade_url,
        }
    }

    /// 阶段超时
    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Extract => self.extract_timeout_secs,
            Stage::Chunk => self.chunk_timeout_secs,
            Stage::Map => self.map_timeout_secs,
            Stage::Grade => self.grade_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_opt(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var_name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: std::any::type_name::<T>().to_string(),
            }),
        Err(_) => Ok(default),
    }
}
