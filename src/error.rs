use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 存储层错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 外部阶段服务错误
    #[error("阶段服务错误: {0}")]
    Adapter(#[from] AdapterError),
    /// 流水线状态错误
    #[error("流水线错误: {0}")]
    Pipeline(#[from] PipelineError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 存储层错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 记录不存在
    #[error("记录不存在: {what}")]
    NotFound { what: String },
    /// 作业 ID 重复
    #[error("作业已存在: {job_id}")]
    DuplicateJob { job_id: String },
    /// 同一作业中学号重复
    #[error("学生已在队列中: 作业 {job_id} 学号 {roll_number}")]
    DuplicateStudent { job_id: String, roll_number: String },
    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    /// 行数据无法解析
    #[error("无法解析字段 {column} 的值: {value}")]
    Corrupt { column: String, value: String },
}

/// 外部阶段服务错误
///
/// 决定了失败是否可以重试：网络错误、超时、5xx、408、429 视为瞬时错误，
/// 其他 4xx 和服务明确声明的失败视为永久错误。
#[derive(Debug, Error)]
pub enum AdapterError {
    /// 瞬时错误，可以重试
    #[error("瞬时错误 ({endpoint}): {message}")]
    Transient { endpoint: String, message: String },
    /// 永久错误，不再重试
    #[error("永久错误 ({endpoint}): {message}")]
    Permanent { endpoint: String, message: String },
    /// 调用超时
    #[error("调用超时 ({endpoint}), 超时时间: {timeout_secs}秒")]
    Timeout { endpoint: String, timeout_secs: u64 },
    /// 响应解析失败
    #[error("响应解析失败: {0}")]
    Decode(String),
}

impl AdapterError {
    /// 是否可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::Transient { .. } | AdapterError::Timeout { .. }
        )
    }
}

/// 流水线状态错误
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 当前状态不允许该操作
    #[error("当前状态不允许该操作: {0}")]
    InvalidState(String),
    /// 发现阶段没有得到任何学号
    #[error("未发现任何学号")]
    EmptyRoster,
    /// 非法阶段名
    #[error("未知阶段: {0}")]
    UnknownStage(String),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 读取配置文件失败
    #[error("读取配置文件失败 ({path}): {source}")]
    FileReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

// ========== 从常见错误类型转换 ==========

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Store(StoreError::Database(err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Adapter(AdapterError::Decode(err.to_string()))
    }
}

impl From<regex::Error> for AppError {
    fn from(err: regex::Error) -> Self {
        AppError::Other(format!("正则表达式错误: {}", err))
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建记录不存在错误
    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::Store(StoreError::NotFound { what: what.into() })
    }

    /// 创建状态错误
    pub fn invalid_state(message: impl Into<String>) -> Self {
        AppError::Pipeline(PipelineError::InvalidState(message.into()))
    }

    /// 是否是“记录不存在”
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::Store(StoreError::NotFound { .. }))
    }

    /// 是否是“状态不允许”
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, AppError::Pipeline(PipelineError::InvalidState(_)))
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_retryable() {
        let transient = AdapterError::Transient {
            endpoint: "ocr".into(),
            message: "connection reset".into(),
        };
        let timeout = AdapterError::Timeout {
            endpoint: "ocr".into(),
            timeout_secs: 300,
        };
        let permanent = AdapterError::Permanent {
            endpoint: "qa".into(),
            message: "missing chunks".into(),
        };

        assert!(transient.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!AdapterError::Decode("bad json".into()).is_retryable());
    }

    #[test]
    fn test_app_error_helpers() {
        assert!(AppError::not_found("job x").is_not_found());
        assert!(AppError::invalid_state("not failed").is_invalid_state());
        assert!(!AppError::Other("x".into()).is_not_found());
    }
}
