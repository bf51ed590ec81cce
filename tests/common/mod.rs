//! 集成测试共用的K线数据源桩

#![allow(dead_code)]

use async_trait::async_trait;
use kline_backfill::klcommon::{
    AppError, BackfillSettings, Candle, DownloadTask, Interval, KlineSource, Result, StorageLayout,
};
use kline_backfill::kldata::{KlineBackfiller, RateLimitedFetcher, SeriesStore};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const SYMBOL: &str = "BTCUSDT";

/// 构造一根K线，价格随开盘时间变化，便于区分
pub fn candle(open_time: i64, interval: Interval) -> Candle {
    let price = Decimal::new(open_time / 60_000 + 100, 1);
    Candle {
        open_time,
        open: price,
        high: price + Decimal::ONE,
        low: price - Decimal::ONE,
        close: price,
        volume: Decimal::new(12_345, 3),
        close_time: open_time + interval.duration_ms() - 1,
        quote_asset_volume: Decimal::new(67_890, 2),
        number_of_trades: 7,
        taker_buy_base_asset_volume: Decimal::new(6, 0),
        taker_buy_quote_asset_volume: Decimal::new(600, 0),
        ignore: "0".to_string(),
    }
}

/// `[from, to)` 内每个周期一根K线
pub fn series(from: i64, to: i64, interval: Interval) -> Vec<Candle> {
    let step = interval.duration_ms();
    (0..)
        .map(|i| from + i * step)
        .take_while(|t| *t < to)
        .map(|t| candle(t, interval))
        .collect()
}

/// 模拟交易所：按 `[startTime, endTime]` 闭区间和 limit 返回已知K线，并记录所有请求
pub struct SyntheticSource {
    candles: BTreeMap<i64, Candle>,
    /// 开盘时间早于此值的窗口请求返回错误
    fail_before: Option<i64>,
    /// 倒序返回，检验合并排序
    reverse: bool,
    pub tasks: Mutex<Vec<DownloadTask>>,
}

impl SyntheticSource {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self {
            candles: candles.into_iter().map(|c| (c.open_time, c)).collect(),
            fail_before: None,
            reverse: false,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_before(mut self, open_time: i64) -> Self {
        self.fail_before = Some(open_time);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn recorded_tasks(&self) -> Vec<DownloadTask> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl KlineSource for SyntheticSource {
    async fn download_klines(&self, task: &DownloadTask) -> Result<Vec<Candle>> {
        self.tasks.lock().unwrap().push(task.clone());

        let start = task.start_time.unwrap_or(i64::MIN);
        let end = task.end_time.unwrap_or(i64::MAX);
        if matches!(self.fail_before, Some(limit) if start < limit) {
            return Err(AppError::FetchError { status: Some(503), body: "service unavailable".to_string() });
        }

        let mut klines: Vec<Candle> = self
            .candles
            .range(start..=end)
            .take(task.limit)
            .map(|(_, c)| c.clone())
            .collect();
        if self.reverse {
            klines.reverse();
        }
        Ok(klines)
    }
}

/// 每次请求都失败的数据源
#[derive(Default)]
pub struct FailingSource {
    pub calls: AtomicUsize,
}

#[async_trait]
impl KlineSource for FailingSource {
    async fn download_klines(&self, _task: &DownloadTask) -> Result<Vec<Candle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::FetchError { status: Some(500), body: "internal error".to_string() })
    }
}

/// 每个请求先等待固定时长再交给内部数据源，配合暂停的tokio时钟控制完成顺序
pub struct DelayedSource<S> {
    pub inner: S,
    delay: Duration,
}

impl<S> DelayedSource<S> {
    pub fn new(inner: S, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl<S: KlineSource> KlineSource for DelayedSource<S> {
    async fn download_klines(&self, task: &DownloadTask) -> Result<Vec<Candle>> {
        tokio::time::sleep(self.delay).await;
        self.inner.download_klines(task).await
    }
}

/// 起点不早于 `split` 的窗口在 `fail_after` 后失败，更早的窗口在 `empty_after` 后返回空
pub struct SplitSource {
    split: i64,
    fail_after: Duration,
    empty_after: Duration,
    pub calls: AtomicUsize,
}

impl SplitSource {
    pub fn new(split: i64, fail_after: Duration, empty_after: Duration) -> Self {
        Self { split, fail_after, empty_after, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl KlineSource for SplitSource {
    async fn download_klines(&self, task: &DownloadTask) -> Result<Vec<Candle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if task.start_time.unwrap_or(i64::MIN) >= self.split {
            tokio::time::sleep(self.fail_after).await;
            Err(AppError::FetchError { status: Some(503), body: "service unavailable".to_string() })
        } else {
            tokio::time::sleep(self.empty_after).await;
            Ok(Vec::new())
        }
    }
}

pub fn settings(worker_count: usize, max_rows_per_request: usize) -> BackfillSettings {
    BackfillSettings {
        worker_count,
        max_rows_per_request,
        ..BackfillSettings::default()
    }
}

/// 不节流的补齐器
pub fn backfiller<S: KlineSource>(
    source: S,
    data_dir: &Path,
    layout: StorageLayout,
    settings: BackfillSettings,
) -> KlineBackfiller<S> {
    let fetcher = RateLimitedFetcher::new(source, Duration::ZERO, settings.max_rows_per_request);
    KlineBackfiller::with_fetcher(fetcher, SeriesStore::new(data_dir, layout), settings).unwrap()
}
