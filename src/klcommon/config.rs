//! 补齐服务配置模块

use crate::klcommon::api::MAX_KLINE_LIMIT;
use crate::klcommon::{AppError, Interval, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/BackfillConfig.toml";

fn default_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_worker_count() -> usize {
    10
}

fn default_safety_buffer() -> usize {
    4
}

fn default_requests_per_minute() -> u32 {
    1200
}

fn default_max_rows_per_request() -> usize {
    MAX_KLINE_LIMIT
}

fn default_stop_threshold() -> usize {
    10
}

fn default_history_start() -> String {
    "2016-12-31".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_file_prefix() -> String {
    "kline_backfill.log".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string()]
}

fn default_intervals() -> Vec<Interval> {
    vec![Interval::Minute1]
}

/// 补齐服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub backfill: BackfillSettings,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// 命令行未指定时使用的交易对
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// 命令行未指定时使用的K线周期
    #[serde(default = "default_intervals")]
    pub intervals: Vec<Interval>,
}

/// REST接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// 代理地址，例如 http://127.0.0.1:1080
    #[serde(default)]
    pub proxy_url: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// 补齐引擎参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillSettings {
    /// 并发worker数
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// 节流计算时额外加上的worker数
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: usize,

    /// 全局每分钟请求预算
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    #[serde(default = "default_max_rows_per_request")]
    pub max_rows_per_request: usize,

    /// 空响应累计达到此数即认为已到历史起点
    #[serde(default = "default_stop_threshold")]
    pub empty_stop_threshold: usize,

    /// 请求失败累计达到此数即中止
    #[serde(default = "default_stop_threshold")]
    pub exception_stop_threshold: usize,

    /// 中止时是否仍持久化已获取的数据
    #[serde(default)]
    pub persist_partial_on_error: bool,

    /// 新序列的起始日期 (YYYY-MM-DD 或 DD/MM/YYYY)
    #[serde(default = "default_history_start")]
    pub history_start: String,
}

/// 序列文件的存放方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageLayout {
    /// 每个 (symbol, interval) 一个文件
    #[default]
    PerSeries,
    /// 按UTC日期拆分，每天一个文件
    PerDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub layout: StorageLayout,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)，RUST_LOG 优先
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            proxy_url: None,
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            safety_buffer: default_safety_buffer(),
            requests_per_minute: default_requests_per_minute(),
            max_rows_per_request: default_max_rows_per_request(),
            empty_stop_threshold: default_stop_threshold(),
            exception_stop_threshold: default_stop_threshold(),
            persist_partial_on_error: false,
            history_start: default_history_start(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            layout: StorageLayout::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            file_prefix: default_file_prefix(),
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            backfill: BackfillSettings::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            symbols: default_symbols(),
            intervals: default_intervals(),
        }
    }
}

impl BackfillSettings {
    /// 每次请求后的休眠时间：`(worker_count + safety_buffer) * 60 / requests_per_minute` 秒
    pub fn throttle_interval(&self) -> std::time::Duration {
        let workers = (self.worker_count + self.safety_buffer) as f64;
        std::time::Duration::from_secs_f64(workers * 60.0 / self.requests_per_minute as f64)
    }

    /// 解析 `history_start` 为毫秒时间戳（UTC零点）
    pub fn history_start_ms(&self) -> Result<i64> {
        parse_date_to_ms(&self.history_start)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(AppError::ValidationError("worker_count 必须大于0".to_string()));
        }
        if self.requests_per_minute == 0 {
            return Err(AppError::ValidationError("requests_per_minute 必须大于0".to_string()));
        }
        if self.max_rows_per_request == 0 || self.max_rows_per_request > MAX_KLINE_LIMIT {
            return Err(AppError::ValidationError(format!(
                "max_rows_per_request 必须在 1..={} 之间，实际为 {}",
                MAX_KLINE_LIMIT, self.max_rows_per_request
            )));
        }
        if self.empty_stop_threshold == 0 || self.exception_stop_threshold == 0 {
            return Err(AppError::ValidationError("停止阈值必须大于0".to_string()));
        }
        self.history_start_ms()?;
        Ok(())
    }
}

/// 解析日期字符串为UTC零点的毫秒时间戳，支持 `YYYY-MM-DD` 和 `DD/MM/YYYY`
pub fn parse_date_to_ms(date: &str) -> Result<i64> {
    let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date, "%d/%m/%Y"))?;
    let midnight = parsed
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| AppError::ValidationError(format!("无效日期: {}", date)))?;
    Ok(Utc.from_utc_datetime(&midnight).timestamp_millis())
}

impl BackfillConfig {
    /// 从文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 按 CONFIG_PATH 环境变量或默认路径加载，文件不存在时使用默认配置
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        if Path::new(&config_path).exists() {
            Self::from_file(&config_path)
        } else {
            warn!("配置文件不存在: {}，使用默认配置", config_path);
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.backfill.validate()?;
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(AppError::ConfigError("symbols 中存在空的交易对".to_string()));
        }
        Ok(())
    }
}
