// K线历史数据补齐程序
use anyhow::{Context, Result};
use clap::Parser;
use kline_backfill::klcommon::config::parse_date_to_ms;
use kline_backfill::klcommon::logging_setup::init_logging;
use kline_backfill::klcommon::{BackfillConfig, BinanceApi, Interval};
use kline_backfill::kldata::backfill::timestamp_to_datetime;
use kline_backfill::kldata::{BackfillOutcome, KlineBackfiller, SeriesStore};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Backfill historical Binance spot klines into local CSV series.", long_about = None)]
struct Args {
    /// Comma-separated list of symbols (e.g., "BTCUSDT,ETHUSDT"). Defaults to the config file.
    #[arg(short, long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Comma-separated list of intervals (e.g., "1m,1h"). Defaults to the config file.
    #[arg(short, long, value_delimiter = ',')]
    intervals: Vec<String>,

    /// Backfill every supported interval, widest first.
    #[arg(long, default_value_t = false)]
    all_intervals: bool,

    /// History start date, "YYYY-MM-DD" or "DD/MM/YYYY". Defaults to backfill.history_start.
    #[arg(long)]
    start_date: Option<String>,

    /// End date (exclusive). Defaults to the exchange server time.
    #[arg(long)]
    end_date: Option<String>,

    /// Extend existing series from their last candle instead of skipping them.
    #[arg(long, default_value_t = false)]
    update: bool,

    /// Path to the TOML config file. Defaults to $CONFIG_PATH or config/BackfillConfig.toml.
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
    info!(target: "app", "🚀 启动K线历史数据补齐程序");

    let symbols = if args.symbols.is_empty() { config.symbols.clone() } else { args.symbols.clone() };
    let intervals: Vec<Interval> = if args.all_intervals {
        Interval::ALL.to_vec()
    } else if args.intervals.is_empty() {
        config.intervals.clone()
    } else {
        args.intervals
            .iter()
            .map(|s| s.trim().parse::<Interval>())
            .collect::<std::result::Result<_, _>>()?
    };

    let start_ms = match &args.start_date {
        Some(date) => parse_date_to_ms(date)?,
        None => config.backfill.history_start_ms()?,
    };

    let api = BinanceApi::new(&config.api)?;
    let end_ms = match &args.end_date {
        Some(date) => parse_date_to_ms(date)?,
        None => api.get_server_time().await.context("获取服务器时间失败")?.server_time,
    };

    info!(
        target: "app",
        symbols = ?symbols,
        intervals = ?intervals,
        update = args.update,
        "补齐范围: {} 到 {}",
        timestamp_to_datetime(start_ms),
        timestamp_to_datetime(end_ms)
    );

    let store = SeriesStore::new(&config.storage.data_dir, config.storage.layout);
    let backfiller = KlineBackfiller::new(api, store, config.backfill.clone())?;

    let mut failures = 0;
    for symbol in &symbols {
        let results = backfiller
            .backfill_all_intervals(symbol, &intervals, start_ms, end_ms, args.update)
            .await;

        for (interval, result) in results {
            match result {
                Ok(BackfillOutcome::Finished(report)) => info!(
                    target: "app",
                    status = ?report.status,
                    rows_persisted = report.rows_persisted,
                    "✅ {}/{} 完成，耗时 {:?}",
                    symbol,
                    interval,
                    report.elapsed
                ),
                Ok(BackfillOutcome::Skipped { .. }) => info!(target: "app", "⏭️ {}/{} 已存在，跳过", symbol, interval),
                Err(e) => {
                    failures += 1;
                    error!(target: "app", error_summary = e.get_error_type_summary(), "❌ {}/{} 失败: {}", symbol, interval, e);
                }
            }
        }
    }

    let (sent, succeeded, failed) = backfiller.fetcher().stats().snapshot();
    info!(
        target: "app",
        "请求统计: 发送 {}，成功 {}，失败 {}；最近已用权重 {}",
        sent,
        succeeded,
        failed,
        backfiller.fetcher().source().used_weight()
    );

    if failures > 0 {
        anyhow::bail!("{} 个序列补齐失败", failures);
    }
    info!(target: "app", "🎉 所有序列补齐完成");
    Ok(())
}
