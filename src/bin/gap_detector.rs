// K线数据空洞检测与修复程序
use anyhow::{Context, Result};
use clap::Parser;
use kline_backfill::klcommon::logging_setup::init_logging;
use kline_backfill::klcommon::{BackfillConfig, BinanceApi, Interval};
use kline_backfill::kldata::gap::log_gap_report;
use kline_backfill::kldata::{GapHealer, HealOutcome, KlineBackfiller, SeriesStore};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Detect and optionally heal gaps in persisted kline series.", long_about = None)]
struct Args {
    /// Comma-separated list of symbols. Defaults to the config file.
    #[arg(short, long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Comma-separated list of intervals. Defaults to the config file.
    #[arg(short, long, value_delimiter = ',')]
    intervals: Vec<String>,

    /// Re-fetch detected gaps and merge recovered candles back into the series.
    #[arg(long, default_value_t = false)]
    repair: bool,

    /// Number of gaps listed per series in the report.
    #[arg(long, default_value_t = 20)]
    max_report_rows: usize,

    /// Path to the TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override storage.data_dir.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BackfillConfig::from_file(path).with_context(|| format!("加载配置文件失败: {}", path.display()))?,
        None => BackfillConfig::load()?,
    };
    if let Some(data_dir) = &args.data_dir {
        config.storage.data_dir = data_dir.clone();
    }

    let _log_guard = init_logging(&config.logging)?;
    info!(target: "app", "🔍 开始检测K线数据空洞...");

    let symbols = if args.symbols.is_empty() { config.symbols.clone() } else { args.symbols.clone() };
    let intervals: Vec<Interval> = if args.intervals.is_empty() {
        config.intervals.clone()
    } else {
        args.intervals
            .iter()
            .map(|s| s.trim().parse::<Interval>())
            .collect::<std::result::Result<_, _>>()?
    };

    let api = BinanceApi::new(&config.api)?;
    let store = SeriesStore::new(&config.storage.data_dir, config.storage.layout);
    let backfiller = KlineBackfiller::new(api, store, config.backfill.clone())?;
    let healer = GapHealer::new(&backfiller);

    let mut total_gaps = 0;
    let mut remaining_gaps = 0;
    for symbol in &symbols {
        for &interval in &intervals {
            let gaps = match healer.detect(symbol, interval) {
                Ok(gaps) => gaps,
                Err(e) => {
                    warn!(target: "app", "⚠️ {}/{} 无法检测: {}", symbol, interval, e);
                    continue;
                }
            };
            log_gap_report(symbol, interval, &gaps, args.max_report_rows);
            total_gaps += gaps.len();

            if !args.repair || gaps.is_empty() {
                remaining_gaps += gaps.len();
                continue;
            }

            match healer.heal(symbol, interval).await {
                Ok(HealOutcome::NoGaps) => {}
                Ok(HealOutcome::NoAdditionalData { gaps, failed_gaps }) => {
                    info!(target: "app", "{}/{}: {} 个空洞无更多数据 (失败 {})", symbol, interval, gaps, failed_gaps)
                }
                Ok(HealOutcome::Healed { gaps, healed_gaps, failed_gaps, rows_added }) => info!(
                    target: "app",
                    "{}/{}: 修复 {}/{} 个空洞，失败 {}，新增 {} 根K线",
                    symbol,
                    interval,
                    healed_gaps,
                    gaps,
                    failed_gaps,
                    rows_added
                ),
                Err(e) => error!(target: "app", "❌ {}/{} 修复失败: {}", symbol, interval, e),
            }

            // 修复后重新扫描
            let left = healer.detect(symbol, interval)?;
            info!(target: "app", "{}/{}: 修复后剩余 {} 个空洞", symbol, interval, left.len());
            remaining_gaps += left.len();
        }
    }

    info!(target: "app", "✅ 检测完成，共发现 {} 个空洞，剩余 {} 个", total_gaps, remaining_gaps);
    Ok(())
}
