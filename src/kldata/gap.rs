use crate::klcommon::{AppError, Candle, Interval, KlineSource, Result, TimeWindow};
use crate::kldata::backfill::{timestamp_to_datetime, KlineBackfiller, RunStatus};
use crate::kldata::store::merge_candles;
use tracing::{debug, info, instrument, warn};

/// 数据空洞信息
#[derive(Debug, Clone, PartialEq)]
pub struct DataGap {
    /// 缺失的时间范围 `[前一根开盘时间 + 周期, 后一根开盘时间)`
    pub window: TimeWindow,
    pub missing_periods: i64,
    pub duration_hours: f64,
}

/// 单个序列的空洞统计
#[derive(Debug, Clone, PartialEq)]
pub struct GapSummary {
    pub gap_count: usize,
    pub missing_periods: i64,
    pub widest: Option<DataGap>,
}

/// 修复结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealOutcome {
    /// 序列连续，没有空洞
    NoGaps,
    /// 检测到空洞，但数据源也没有这些时间段的数据
    NoAdditionalData { gaps: usize, failed_gaps: usize },
    Healed {
        gaps: usize,
        healed_gaps: usize,
        failed_gaps: usize,
        rows_added: usize,
    },
}

/// 在已排序的序列中查找空洞：后一根开盘时间晚于前一根的下一个周期即为空洞
pub fn find_gaps(series: &[Candle], interval: Interval) -> Vec<TimeWindow> {
    series
        .windows(2)
        .filter_map(|pair| {
            let expected = interval.next_open_time(pair[0].open_time);
            (pair[1].open_time > expected).then_some(TimeWindow {
                start_ms: expected,
                end_ms: pair[1].open_time,
            })
        })
        .collect()
}

/// 空洞内缺失的K线数；月线按自然月逐个计数
fn missing_periods(window: &TimeWindow, interval: Interval) -> i64 {
    if interval != Interval::Month1 {
        return window.candle_count(interval.duration_ms());
    }
    let mut count = 0;
    let mut open_time = window.start_ms;
    while open_time < window.end_ms {
        count += 1;
        open_time = interval.next_open_time(open_time);
    }
    count
}

/// 带缺失周期数的空洞列表，按缺失周期数降序
pub fn describe_gaps(series: &[Candle], interval: Interval) -> Vec<DataGap> {
    let mut gaps: Vec<DataGap> = find_gaps(series, interval)
        .into_iter()
        .map(|window| {
            let span = window.end_ms - window.start_ms;
            DataGap {
                missing_periods: missing_periods(&window, interval),
                duration_hours: span as f64 / (1000.0 * 3600.0),
                window,
            }
        })
        .collect();
    gaps.sort_by(|a, b| b.missing_periods.cmp(&a.missing_periods));
    gaps
}

pub fn summarize_gaps(gaps: &[DataGap]) -> GapSummary {
    GapSummary {
        gap_count: gaps.len(),
        missing_periods: gaps.iter().map(|g| g.missing_periods).sum(),
        widest: gaps.iter().max_by_key(|g| g.missing_periods).cloned(),
    }
}

/// 输出单个序列的空洞报告
pub fn log_gap_report(symbol: &str, interval: Interval, gaps: &[DataGap], max_rows: usize) {
    if gaps.is_empty() {
        info!(target: "gap", "🎉 {}/{}: 没有发现数据空洞", symbol, interval);
        return;
    }

    let summary = summarize_gaps(gaps);
    info!(target: "gap", "📊 {}/{}: 空洞数量 {}，缺失周期总数 {}", symbol, interval, summary.gap_count, summary.missing_periods);
    if let Some(widest) = &summary.widest {
        info!(
            target: "gap",
            "  最严重空洞: {} 到 {} (缺失 {} 个周期, {:.2} 小时)",
            timestamp_to_datetime(widest.window.start_ms),
            timestamp_to_datetime(widest.window.end_inclusive_ms()),
            widest.missing_periods,
            widest.duration_hours
        );
    }

    for gap in gaps.iter().take(max_rows) {
        info!(
            target: "gap",
            "  {:<20} {:<20} {:<8} {:<8.2}",
            timestamp_to_datetime(gap.window.start_ms),
            timestamp_to_datetime(gap.window.end_inclusive_ms()),
            gap.missing_periods,
            gap.duration_hours
        );
    }
    if gaps.len() > max_rows {
        info!(target: "gap", "... 还有 {} 个空洞未显示", gaps.len() - max_rows);
    }
}

/// K线数据空洞修复器
pub struct GapHealer<'a, S> {
    backfiller: &'a KlineBackfiller<S>,
}

impl<'a, S: KlineSource> GapHealer<'a, S> {
    pub fn new(backfiller: &'a KlineBackfiller<S>) -> Self {
        Self { backfiller }
    }

    /// 读取序列并检测空洞，序列不存在时报错
    pub fn detect(&self, symbol: &str, interval: Interval) -> Result<Vec<DataGap>> {
        let series = self.load_series(symbol, interval)?;
        Ok(describe_gaps(&series, interval))
    }

    /// 逐个空洞调用补齐逻辑，合并有效结果后写回
    #[instrument(skip(self), fields(interval = %interval), err)]
    pub async fn heal(&self, symbol: &str, interval: Interval) -> Result<HealOutcome> {
        let series = self.load_series(symbol, interval)?;
        let gaps = find_gaps(&series, interval);
        if gaps.is_empty() {
            info!(target: "gap", "{}/{}: 没有发现数据空洞", symbol, interval);
            return Ok(HealOutcome::NoGaps);
        }

        info!(target: "gap", "🔧 {}/{}: 开始修复 {} 个数据空洞", symbol, interval, gaps.len());

        let mut recovered = Vec::new();
        let mut healed_gaps = 0;
        let mut failed_gaps = 0;
        for gap in &gaps {
            let fetched = match self.backfiller.fetch_range(symbol, interval, gap.start_ms, gap.end_ms).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(target: "gap", "{}/{}: 空洞 {} 修复失败: {}", symbol, interval, gap, e);
                    failed_gaps += 1;
                    continue;
                }
            };

            if fetched.report.status == RunStatus::StoppedError {
                warn!(
                    target: "gap",
                    "{}/{}: 空洞 {} 获取中止: {}",
                    symbol,
                    interval,
                    gap,
                    fetched.report.last_error.as_deref().unwrap_or("未知错误")
                );
                failed_gaps += 1;
            }

            // 空结果或只有一根K线都不算有效数据
            if fetched.candles.len() <= 1 {
                debug!(target: "gap", "{}/{}: 空洞 {} 没有可用数据", symbol, interval, gap);
                continue;
            }
            healed_gaps += 1;
            recovered.push(fetched.candles);
        }

        if recovered.is_empty() {
            info!(target: "gap", "{}/{}: 检测到 {} 个空洞，但数据源没有更多数据", symbol, interval, gaps.len());
            return Ok(HealOutcome::NoAdditionalData {
                gaps: gaps.len(),
                failed_gaps,
            });
        }

        let candles = merge_candles(Vec::new(), recovered.into_iter().flatten().collect());
        let summary = self.backfiller.store().merge_and_persist(symbol, interval, &candles)?;

        info!(
            target: "gap",
            "✅ {}/{}: 修复 {} / {} 个空洞，新增 {} 根K线",
            symbol,
            interval,
            healed_gaps,
            gaps.len(),
            summary.added_rows
        );

        Ok(HealOutcome::Healed {
            gaps: gaps.len(),
            healed_gaps,
            failed_gaps,
            rows_added: summary.added_rows,
        })
    }

    fn load_series(&self, symbol: &str, interval: Interval) -> Result<Vec<Candle>> {
        self.backfiller
            .store()
            .load(symbol, interval)?
            .ok_or_else(|| AppError::ValidationError(format!("序列不存在: {}/{}", symbol, interval)))
    }
}
