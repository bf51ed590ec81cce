//! 统一日志系统初始化模块
//!
//! 控制台与按天滚动的日志文件两路输出，级别以 RUST_LOG 为准，否则取配置

use crate::klcommon::config::LoggingConfig;
use crate::klcommon::{AppError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// 初始化日志系统
///
/// 返回的 guard 必须由 main 持有到程序结束，否则文件日志会丢失尾部
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let filter_str = format!("{},hyper=warn,reqwest=warn", log_level);

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    Registry::default()
        .with(EnvFilter::new(&filter_str))
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("初始化日志系统失败: {}", e)))?;

    Ok(guard)
}
