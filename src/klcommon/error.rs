use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// 调用方参数错误（周期、limit、时间范围），不重试
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// 上游请求失败：非2xx响应时 status 有值，传输/解码失败时为 None
    #[error("Fetch error (status: {status:?}): {body}")]
    FetchError {
        status: Option<u16>,
        body: String,
    },

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// 失败窗口数达到阈值，补齐任务中止
    #[error("Backfill aborted for {symbol}/{interval}: {unpersisted_rows} rows not persisted, last error: {source}")]
    BackfillAborted {
        symbol: String,
        interval: String,
        unpersisted_rows: usize,
        #[source]
        source: Box<AppError>,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Time parsing error: {0}")]
    TimeParseError(#[from] chrono::ParseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Data error: {0}")]
    DataError(String),
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::FetchError {
            status: e.status().map(|s| s.as_u16()),
            body: e.to_string(),
        }
    }
}

impl AppError {
    /// 获取错误类型的简洁摘要，日志中用作稳定的错误分类
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "backfill_request_invalid",
            AppError::FetchError { status: Some(_), .. } => "kline_data_acquisition_failed",
            AppError::FetchError { status: None, .. } => "market_data_connection_failed",
            AppError::PersistenceError(_) => "kline_data_persistence_failed",
            AppError::BackfillAborted { .. } => "backfill_run_aborted",
            AppError::IoError(_) => "kline_file_operation_failed",
            AppError::JsonError(_) => "kline_data_parsing_failed",
            AppError::CsvError(_) => "kline_file_format_invalid",
            AppError::TimeParseError(_) => "kline_timestamp_invalid",
            AppError::ConfigError(_) => "backfill_configuration_invalid",
            AppError::DataError(_) => "kline_data_validation_failed",
        }
    }

    /// 检查错误是否为可重试类型
    ///
    /// 补齐控制器本身不按此重试，窗口失败只计数；供调用方决定是否整体重跑
    pub fn is_retryable(&self) -> bool {
        match self {
            // 429/418 限流和5xx服务端错误可重试，其余4xx是请求本身的问题
            AppError::FetchError { status: Some(code), .. } => {
                *code == 429 || *code == 418 || *code >= 500
            }
            AppError::FetchError { status: None, .. } => true,
            AppError::IoError(_) => true,
            AppError::BackfillAborted { source, .. } => source.is_retryable(),

            AppError::ValidationError(_)
            | AppError::PersistenceError(_)
            | AppError::JsonError(_)
            | AppError::CsvError(_)
            | AppError::TimeParseError(_)
            | AppError::ConfigError(_)
            | AppError::DataError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
