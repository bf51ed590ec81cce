use crate::klcommon::{BackfillSettings, Candle, DownloadTask, Interval, KlineSource, Result, TimeWindow};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// 请求计数: (发送的请求数, 成功的请求数, 失败的请求数)
#[derive(Debug, Default)]
pub struct RequestStats {
    pub sent: AtomicUsize,
    pub succeeded: AtomicUsize,
    pub failed: AtomicUsize,
}

impl RequestStats {
    pub fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.sent.load(Ordering::Relaxed),
            self.succeeded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

/// 带节流的K线获取器
///
/// 每个请求结束后（无论成功失败）休眠固定的节流时间。节流时间按总worker数计算，
/// 所有worker各自休眠即可整体满足每分钟请求预算。失败不在这里重试
pub struct RateLimitedFetcher<S> {
    source: S,
    throttle: Duration,
    max_rows_per_request: usize,
    stats: RequestStats,
}

impl<S: KlineSource> RateLimitedFetcher<S> {
    pub fn new(source: S, throttle: Duration, max_rows_per_request: usize) -> Self {
        Self {
            source,
            throttle,
            max_rows_per_request,
            stats: RequestStats::default(),
        }
    }

    /// 按补齐参数创建，节流时间取 `settings.throttle_interval()`
    pub fn from_settings(source: S, settings: &BackfillSettings) -> Self {
        Self::new(source, settings.throttle_interval(), settings.max_rows_per_request)
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    pub fn max_rows_per_request(&self) -> usize {
        self.max_rows_per_request
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// 获取一个窗口的K线
    pub async fn fetch(&self, symbol: &str, interval: Interval, window: &TimeWindow) -> Result<Vec<Candle>> {
        let task = DownloadTask::for_window(symbol, interval, window, self.max_rows_per_request);
        let request_id = self.stats.sent.fetch_add(1, Ordering::Relaxed) + 1;

        let result = self.source.download_klines(&task).await;
        match &result {
            Ok(klines) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(target: "fetcher", request_id, %window, count = klines.len(), "{}/{}: 窗口请求完成", symbol, interval);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "fetcher",
                    request_id,
                    %window,
                    error_summary = e.get_error_type_summary(),
                    "{}/{}: 窗口请求失败: {}", symbol, interval, e
                );
            }
        }

        if !self.throttle.is_zero() {
            tokio::time::sleep(self.throttle).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::AppError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingSource {
        tasks: Mutex<Vec<DownloadTask>>,
        fail: bool,
    }

    #[async_trait]
    impl KlineSource for RecordingSource {
        async fn download_klines(&self, task: &DownloadTask) -> Result<Vec<Candle>> {
            self.tasks.lock().unwrap().push(task.clone());
            if self.fail {
                Err(AppError::FetchError { status: Some(500), body: "boom".to_string() })
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_builds_inclusive_end_request() {
        let source = RecordingSource { tasks: Mutex::new(Vec::new()), fail: false };
        let fetcher = RateLimitedFetcher::new(source, Duration::ZERO, 500);
        let window = TimeWindow::new(60_000, 120_000).unwrap();

        fetcher.fetch("ETHUSDT", Interval::Minute1, &window).await.unwrap();

        let tasks = fetcher.source().tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].start_time, Some(60_000));
        assert_eq!(tasks[0].end_time, Some(119_999));
        assert_eq!(tasks[0].limit, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_sleeps_after_failure() {
        let source = RecordingSource { tasks: Mutex::new(Vec::new()), fail: true };
        let fetcher = RateLimitedFetcher::new(source, Duration::from_millis(700), 1000);
        let window = TimeWindow::new(0, 60_000).unwrap();

        let started = tokio::time::Instant::now();
        let result = fetcher.fetch("ETHUSDT", Interval::Minute1, &window).await;

        assert!(matches!(result, Err(AppError::FetchError { status: Some(500), .. })));
        assert!(started.elapsed() >= Duration::from_millis(700));
        assert_eq!(fetcher.stats().snapshot(), (1, 0, 1));
    }
}
