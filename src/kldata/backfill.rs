use crate::klcommon::{AppError, BackfillSettings, Candle, Interval, KlineSource, Result, TimeWindow};
use crate::kldata::fetcher::RateLimitedFetcher;
use crate::kldata::partitioner::partition;
use crate::kldata::store::{merge_candles, SeriesStore};
use chrono::{TimeZone, Utc};
use futures::{stream, StreamExt};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// 一次补齐任务的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    /// 所有窗口处理完毕
    Completed,
    /// 空响应达到阈值，视为已到达历史数据起点
    StoppedExhausted,
    /// 失败次数达到阈值
    StoppedError,
}

/// 补齐任务统计
#[derive(Debug, Clone)]
pub struct RunReport {
    pub symbol: String,
    pub interval: Interval,
    pub status: RunStatus,
    pub windows_total: usize,
    pub windows_fetched: usize,
    pub windows_empty: usize,
    pub windows_failed: usize,
    /// 停止标志置位后未发出请求的窗口
    pub windows_skipped: usize,
    pub rows_fetched: usize,
    pub rows_persisted: usize,
    pub elapsed: Duration,
    pub last_error: Option<String>,
}

/// `fetch_range` 的结果：排序去重后的K线，尚未持久化
#[derive(Debug)]
pub struct FetchedRange {
    pub report: RunReport,
    pub candles: Vec<Candle>,
    /// 触发 `StoppedError` 的那次失败
    pub error: Option<AppError>,
}

/// `backfill` 的结果
#[derive(Debug)]
pub enum BackfillOutcome {
    /// 序列已存在且未要求更新
    Skipped { symbol: String, interval: Interval },
    Finished(RunReport),
}

/// 单次运行的共享状态，所有worker通过同一把锁修改
struct RunState {
    status: RunStatus,
    stop: bool,
    batches: Vec<Vec<Candle>>,
    empty_count: usize,
    exception_count: usize,
    windows_fetched: usize,
    windows_skipped: usize,
    rows_fetched: usize,
    last_error: Option<String>,
    trigger_error: Option<AppError>,
}

impl RunState {
    fn new() -> Self {
        Self {
            status: RunStatus::Running,
            stop: false,
            batches: Vec::new(),
            empty_count: 0,
            exception_count: 0,
            windows_fetched: 0,
            windows_skipped: 0,
            rows_fetched: 0,
            last_error: None,
            trigger_error: None,
        }
    }
}

fn lock_state(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 将毫秒时间戳转换为可读的日期时间格式
pub fn timestamp_to_datetime(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

/// K线数据补齐模块
///
/// 把时间范围切成请求窗口，从最新的窗口开始并发获取，合并后交给 `SeriesStore`
pub struct KlineBackfiller<S> {
    fetcher: RateLimitedFetcher<S>,
    store: SeriesStore,
    settings: BackfillSettings,
}

impl<S: KlineSource> KlineBackfiller<S> {
    /// 创建新的K线补齐器实例
    pub fn new(source: S, store: SeriesStore, settings: BackfillSettings) -> Result<Self> {
        settings.validate()?;
        let fetcher = RateLimitedFetcher::from_settings(source, &settings);
        Ok(Self { fetcher, store, settings })
    }

    /// 使用自定义获取器（例如不节流）创建实例
    pub fn with_fetcher(fetcher: RateLimitedFetcher<S>, store: SeriesStore, settings: BackfillSettings) -> Result<Self> {
        settings.validate()?;
        if fetcher.max_rows_per_request() > settings.max_rows_per_request {
            return Err(AppError::ValidationError(format!(
                "获取器的单次请求条数 {} 超过配置上限 {}",
                fetcher.max_rows_per_request(),
                settings.max_rows_per_request
            )));
        }
        Ok(Self { fetcher, store, settings })
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    pub fn fetcher(&self) -> &RateLimitedFetcher<S> {
        &self.fetcher
    }

    pub fn settings(&self) -> &BackfillSettings {
        &self.settings
    }

    /// 获取 `[start_ms, end_ms)` 内的K线，不落盘
    #[instrument(skip(self), fields(interval = %interval), err)]
    pub async fn fetch_range(&self, symbol: &str, interval: Interval, start_ms: i64, end_ms: i64) -> Result<FetchedRange> {
        let windows = partition(start_ms, end_ms, interval.duration_ms(), self.fetcher.max_rows_per_request())?;
        let started = Instant::now();

        if windows.is_empty() {
            info!(target: "backfill", "{}/{}: 没有需要补齐的时间范围", symbol, interval);
        } else {
            info!(
                target: "backfill",
                windows = windows.len(),
                workers = self.settings.worker_count,
                "{}/{}: 开始补齐 {} 到 {}",
                symbol,
                interval,
                timestamp_to_datetime(start_ms),
                timestamp_to_datetime(end_ms)
            );
        }

        let state = Mutex::new(RunState::new());

        // 从最新的窗口开始处理，空响应阈值才能代表“到达历史起点”
        stream::iter(windows.iter().rev())
            .map(|window| self.process_window(symbol, interval, window, &state))
            .buffer_unordered(self.settings.worker_count)
            .collect::<Vec<()>>()
            .await;

        let mut state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        if state.status == RunStatus::Running {
            state.status = RunStatus::Completed;
        }

        let batches = std::mem::take(&mut state.batches);
        let candles = merge_candles(Vec::new(), batches.into_iter().flatten().collect());

        let report = RunReport {
            symbol: symbol.to_string(),
            interval,
            status: state.status,
            windows_total: windows.len(),
            windows_fetched: state.windows_fetched,
            windows_empty: state.empty_count,
            windows_failed: state.exception_count,
            windows_skipped: state.windows_skipped,
            rows_fetched: state.rows_fetched,
            rows_persisted: 0,
            elapsed: started.elapsed(),
            last_error: state.last_error.take(),
        };

        info!(
            target: "backfill",
            status = ?report.status,
            fetched = report.windows_fetched,
            empty = report.windows_empty,
            failed = report.windows_failed,
            skipped = report.windows_skipped,
            rows = candles.len(),
            "{}/{}: 窗口处理完成，耗时 {:?}",
            symbol,
            interval,
            report.elapsed
        );

        Ok(FetchedRange {
            report,
            candles,
            error: state.trigger_error.take(),
        })
    }

    /// 处理单个窗口：停止标志已置位时直接跳过，否则请求并记录结果
    async fn process_window(&self, symbol: &str, interval: Interval, window: &TimeWindow, state: &Mutex<RunState>) {
        {
            let mut st = lock_state(state);
            if st.stop {
                st.windows_skipped += 1;
                return;
            }
        }

        // 已发出的请求总会执行完，停止标志只阻止新的请求
        let result = self.fetcher.fetch(symbol, interval, window).await;

        let mut st = lock_state(state);
        match result {
            Ok(klines) if !klines.is_empty() => {
                st.windows_fetched += 1;
                st.rows_fetched += klines.len();
                st.batches.push(klines);
            }
            Ok(_) => {
                st.empty_count += 1;
                if st.empty_count >= self.settings.empty_stop_threshold && !st.stop {
                    st.stop = true;
                    st.status = RunStatus::StoppedExhausted;
                    info!(target: "backfill", "{}/{}: 连续获取到 {} 个空窗口，已到达历史数据起点", symbol, interval, st.empty_count);
                }
            }
            Err(e) => {
                st.exception_count += 1;
                st.last_error = Some(e.to_string());
                if st.exception_count >= self.settings.exception_stop_threshold && !st.stop {
                    st.stop = true;
                    st.status = RunStatus::StoppedError;
                    error!(
                        target: "backfill",
                        error_summary = e.get_error_type_summary(),
                        "{}/{}: 失败次数达到 {}，停止补齐: {}", symbol, interval, st.exception_count, e
                    );
                    st.trigger_error = Some(e);
                }
            }
        }
    }

    /// 补齐一个序列
    ///
    /// 序列已存在时：`update == false` 直接跳过；否则从最后一根K线的下一个周期开始，
    /// 忽略传入的 `start_ms`。只写入 `close_time < end_ms` 的已收盘K线
    #[instrument(skip(self), fields(interval = %interval), err)]
    pub async fn backfill(&self, symbol: &str, interval: Interval, start_ms: i64, end_ms: i64, update: bool) -> Result<BackfillOutcome> {
        let start_ms = match self.store.last_open_time(symbol, interval)? {
            Some(_) if !update => {
                info!(target: "backfill", "{}/{}: 序列已存在且未启用更新，跳过", symbol, interval);
                return Ok(BackfillOutcome::Skipped {
                    symbol: symbol.to_string(),
                    interval,
                });
            }
            Some(last_open_time) => {
                let resume_from = interval.next_open_time(last_open_time);
                info!(target: "backfill", "{}/{}: 已存在历史K线，从 {} 开始补齐", symbol, interval, timestamp_to_datetime(resume_from));
                resume_from
            }
            None => start_ms,
        };

        let FetchedRange { mut report, mut candles, error } = self.fetch_range(symbol, interval, start_ms, end_ms).await?;

        // 收盘时间不早于 end_ms 的K线尚未走完，不写入
        let fetched = candles.len();
        candles.retain(|c| c.close_time < end_ms);
        if candles.len() < fetched {
            debug!(target: "backfill", "{}/{}: 丢弃 {} 根未收盘的K线", symbol, interval, fetched - candles.len());
        }

        if report.status == RunStatus::StoppedError {
            let mut unpersisted_rows = candles.len();
            if self.settings.persist_partial_on_error && !candles.is_empty() {
                warn!(target: "backfill", "{}/{}: 补齐中止，按配置保存已获取的 {} 条K线", symbol, interval, candles.len());
                self.store.merge_and_persist(symbol, interval, &candles)?;
                unpersisted_rows = 0;
            }
            let source = error.unwrap_or_else(|| AppError::FetchError {
                status: None,
                body: report.last_error.clone().unwrap_or_default(),
            });
            return Err(AppError::BackfillAborted {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
                unpersisted_rows,
                source: Box::new(source),
            });
        }

        if !candles.is_empty() {
            let summary = self.store.merge_and_persist(symbol, interval, &candles)?;
            report.rows_persisted = summary.added_rows;
        }

        Ok(BackfillOutcome::Finished(report))
    }

    /// 依次补齐多个周期，从宽周期到窄周期；单个周期失败不影响其他周期
    pub async fn backfill_all_intervals(
        &self,
        symbol: &str,
        intervals: &[Interval],
        start_ms: i64,
        end_ms: i64,
        update: bool,
    ) -> Vec<(Interval, Result<BackfillOutcome>)> {
        let mut ordered = intervals.to_vec();
        ordered.sort_unstable_by(|a, b| b.cmp(a));
        ordered.dedup();

        let mut results = Vec::with_capacity(ordered.len());
        for interval in ordered {
            let result = self.backfill(symbol, interval, start_ms, end_ms, update).await;
            if let Err(e) = &result {
                error!(target: "backfill", "{}/{}: 补齐失败: {}", symbol, interval, e);
            }
            results.push((interval, result));
        }
        results
    }
}
