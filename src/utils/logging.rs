/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::models::{PipelineJob, Stage};

/// 初始化日志
///
/// 优先使用 `RUST_LOG`，否则按 `verbose` 选择 debug / info。重复调用不会报错。
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `config`: 程序配置
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 阅卷流水线");
    info!(
        "💾 队列存储: {}",
        if config.database_url.is_some() {
            "Postgres"
        } else {
            "内存"
        }
    );
    info!("📊 每阶段并发数: {}", config.worker_pool_size);
    for stage in Stage::ALL {
        info!(
            "🔗 {:<8} {} (超时 {}秒)",
            stage.name(),
            config.stage_url(stage),
            config.stage_timeout(stage).as_secs()
        );
    }
    info!("{}", "=".repeat(60));
}

/// 打印作业最终统计信息
///
/// # 参数
/// - `job`: 已结束的作业
pub fn print_final_stats(job: &PipelineJob) {
    info!("\n{}", "=".repeat(60));
    info!("📊 作业 {} 处理完成统计", job.job_id);
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("📌 作业状态: {}", job.status);
    info!("✅ 成功: {}/{}", job.students_completed, job.total_students);
    info!("❌ 失败: {}", job.students_failed);
    info!("📈 完成率: {}%", job.completion_rate());
    if let Some(err) = &job.error_message {
        info!("⚠️ 错误信息: {}", err);
    }
    info!("{}", "=".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("短文本", 10), "短文本");
        assert_eq!(truncate_text("服务返回了很长的错误信息", 4), "服务返回...");
    }
}
