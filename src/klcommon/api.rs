use crate::klcommon::config::ApiConfig;
use crate::klcommon::{AppError, Candle, DownloadTask, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// 交易所单次K线请求允许的最大条数
pub const MAX_KLINE_LIMIT: usize = 1000;

/// K线数据源
///
/// 补齐引擎只依赖K线列表接口：给定 `(symbol, interval, startTime, endTime, limit)`，
/// 返回按 `open_time` 升序、不超过 `limit` 条的K线，范围内无数据时返回空数组
#[async_trait]
pub trait KlineSource: Send + Sync {
    async fn download_klines(&self, task: &DownloadTask) -> Result<Vec<Candle>>;
}

#[async_trait]
impl<T: KlineSource + ?Sized> KlineSource for Arc<T> {
    async fn download_klines(&self, task: &DownloadTask) -> Result<Vec<Candle>> {
        (**self).download_klines(task).await
    }
}

/// 币安服务器时间响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTime {
    /// 服务器时间（毫秒时间戳）
    #[serde(rename = "serverTime")]
    pub server_time: i64,
}

/// 币安现货REST客户端
#[derive(Clone, Debug)]
pub struct BinanceApi {
    client: Client,
    api_url: String,
    /// 交易所回报的已用权重（x-mbx-used-weight），按实例统计
    used_weight: Arc<AtomicU64>,
}

impl BinanceApi {
    /// 按配置创建API客户端实例
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client_builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));

        let client = match &config.proxy_url {
            Some(proxy_url) => match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => {
                    info!(target: "api", "使用代理: {}", proxy_url);
                    client_builder.proxy(proxy).build()
                }
                Err(e) => {
                    warn!(target: "api", "设置代理失败，将尝试直接连接: {} - {}", proxy_url, e);
                    client_builder.build()
                }
            },
            None => client_builder.build(),
        }
        .map_err(|e| AppError::ConfigError(format!("创建HTTP客户端失败: {}", e)))?;

        info!(target: "api", "初始化币安API客户端，端点: {}", config.base_url);
        Ok(Self {
            client,
            api_url: config.base_url.trim_end_matches('/').to_string(),
            used_weight: Arc::new(AtomicU64::new(0)),
        })
    }

    /// 最近一次响应回报的已用权重
    pub fn used_weight(&self) -> u64 {
        self.used_weight.load(Ordering::Relaxed)
    }

    fn record_used_weight(&self, response: &reqwest::Response) {
        let weight = response
            .headers()
            .get("x-mbx-used-weight")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(weight) = weight {
            self.used_weight.store(weight, Ordering::Relaxed);
            debug!(target: "api", used_weight = weight, "更新已用请求权重");
        }
    }

    /// 发送GET请求，非2xx响应转换为 FetchError
    async fn get_text(&self, url: &str) -> Result<String> {
        let response = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(target: "api", "请求失败: URL={}, 错误: {}", url, e);
                return Err(AppError::FetchError { status: None, body: e.to_string() });
            }
        };
        self.record_used_weight(&response);

        let status = response.status();
        let text = response.text().await.map_err(|e| AppError::FetchError {
            status: Some(status.as_u16()),
            body: format!("读取响应内容失败: {}", e),
        })?;

        if !status.is_success() {
            error!(target: "api", "API响应状态错误: URL={}, {} - {}", url, status, text);
            return Err(AppError::FetchError { status: Some(status.as_u16()), body: text });
        }
        Ok(text)
    }

    /// 获取币安服务器时间
    #[instrument(skip(self), err)]
    pub async fn get_server_time(&self) -> Result<ServerTime> {
        let url = format!("{}/api/v3/time", self.api_url);
        let text = self.get_text(&url).await?;
        let server_time: ServerTime = serde_json::from_str(&text)?;
        Ok(server_time)
    }
}

#[async_trait]
impl KlineSource for BinanceApi {
    /// 下载K线数据
    async fn download_klines(&self, task: &DownloadTask) -> Result<Vec<Candle>> {
        if task.limit == 0 || task.limit > MAX_KLINE_LIMIT {
            return Err(AppError::ValidationError(format!(
                "limit 必须在 1..={} 之间，实际为 {}",
                MAX_KLINE_LIMIT, task.limit
            )));
        }

        // 构建URL参数
        let mut url_params = format!(
            "symbol={}&interval={}&limit={}",
            task.symbol, task.interval, task.limit
        );
        if let Some(start_time) = task.start_time {
            url_params.push_str(&format!("&startTime={}", start_time));
        }
        if let Some(end_time) = task.end_time {
            url_params.push_str(&format!("&endTime={}", end_time));
        }

        let url = format!("{}/api/v3/klines?{}", self.api_url, url_params);
        debug!(target: "api", "下载K线: {}", url);

        let response_text = self.get_text(&url).await?;

        let raw_klines: Vec<Vec<Value>> = serde_json::from_str(&response_text).map_err(|e| {
            error!(target: "api", "{}/{}: 解析K线JSON失败: {}", task.symbol, task.interval, e);
            AppError::FetchError {
                status: None,
                body: format!("解析K线JSON失败: {}", e),
            }
        })?;

        let klines = raw_klines
            .iter()
            .filter_map(|raw| Candle::from_raw_kline(raw))
            .collect::<Vec<Candle>>();

        // 部分行解析失败时整批作废，避免持久化出缺行的序列
        if klines.len() != raw_klines.len() {
            return Err(AppError::DataError(format!(
                "解析 {}/{} 的部分K线失败: 解析了 {}/{} 条K线",
                task.symbol,
                task.interval,
                klines.len(),
                raw_klines.len()
            )));
        }

        debug!(target: "api", "收到 {} 条 {}/{} 的K线", klines.len(), task.symbol, task.interval);
        Ok(klines)
    }
}
