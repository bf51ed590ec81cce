use crate::klcommon::{AppError, Candle, Interval, KlineData, Result, StorageLayout, CANDLE_HEADERS};
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// 一次持久化的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistSummary {
    /// 新写入的K线数（去重后）
    pub added_rows: usize,
    /// 序列总行数
    pub total_rows: usize,
}

/// 合并K线：按 `open_time` 稳定排序，重复的 `open_time` 保留先出现的一条
///
/// 调用方把已有数据放在前面，因此已持久化的行优先于新获取的行
pub fn merge_candles(mut existing: Vec<Candle>, new_candles: Vec<Candle>) -> Vec<Candle> {
    existing.extend(new_candles);
    existing.sort_by_key(|c| c.open_time);
    existing.dedup_by_key(|c| c.open_time);
    existing
}

/// K线序列的本地存储
///
/// 每个 (symbol, interval) 一份升序、无重复 `open_time` 的CSV；按日期分区时
/// 拆成 `<SYMBOL>_<interval>/YYYYMMDD.csv`。写入一律先写临时文件再重命名
#[derive(Debug, Clone)]
pub struct SeriesStore {
    data_dir: PathBuf,
    layout: StorageLayout,
}

impl SeriesStore {
    pub fn new(data_dir: impl Into<PathBuf>, layout: StorageLayout) -> Self {
        Self {
            data_dir: data_dir.into(),
            layout,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn layout(&self) -> StorageLayout {
        self.layout
    }

    /// 序列文件路径（按日期分区时为目录）
    pub fn series_path(&self, symbol: &str, interval: Interval) -> PathBuf {
        match self.layout {
            StorageLayout::PerSeries => self.data_dir.join(format!("{}_{}.csv", symbol, interval)),
            StorageLayout::PerDate => self.data_dir.join(format!("{}_{}", symbol, interval)),
        }
    }

    /// 读取序列，从未补齐过时返回 None
    pub fn load(&self, symbol: &str, interval: Interval) -> Result<Option<Vec<Candle>>> {
        validate_symbol(symbol)?;
        let path = self.series_path(symbol, interval);
        if !path.exists() {
            return Ok(None);
        }

        match self.layout {
            StorageLayout::PerSeries => Ok(Some(read_csv(&path)?)),
            StorageLayout::PerDate => {
                let mut files: Vec<PathBuf> = fs::read_dir(&path)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| p.extension().map_or(false, |ext| ext == "csv"))
                    .collect();
                files.sort();

                let mut candles = Vec::new();
                for file in &files {
                    candles.extend(read_csv(file)?);
                }
                Ok(Some(merge_candles(Vec::new(), candles)))
            }
        }
    }

    /// 序列最后一根K线的开盘时间
    pub fn last_open_time(&self, symbol: &str, interval: Interval) -> Result<Option<i64>> {
        Ok(self
            .load(symbol, interval)?
            .and_then(|candles| candles.last().map(|c| c.open_time)))
    }

    /// 将新K线合并进已有序列并持久化
    #[instrument(skip(self, new_candles), fields(new_rows = new_candles.len()), err)]
    pub fn merge_and_persist(&self, symbol: &str, interval: Interval, new_candles: &[Candle]) -> Result<PersistSummary> {
        validate_symbol(symbol)?;
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| AppError::PersistenceError(format!("创建数据目录失败: {} - {}", self.data_dir.display(), e)))?;

        let summary = match self.layout {
            StorageLayout::PerSeries => {
                let path = self.series_path(symbol, interval);
                let existing = read_existing(&path)?;
                let before = existing.len();
                if new_candles.is_empty() {
                    return Ok(PersistSummary { added_rows: 0, total_rows: before });
                }

                let merged = merge_candles(existing, new_candles.to_vec());
                write_csv_atomic(&path, &merged)?;
                PersistSummary {
                    added_rows: merged.len().saturating_sub(before),
                    total_rows: merged.len(),
                }
            }
            StorageLayout::PerDate => self.persist_by_date(symbol, interval, new_candles)?,
        };

        info!(
            target: "store",
            added_rows = summary.added_rows,
            total_rows = summary.total_rows,
            "{}/{}: 序列已持久化", symbol, interval
        );
        Ok(summary)
    }

    /// 按UTC日期拆分写入，已存在的日期文件合并后重写
    ///
    /// 先为所有日期写好临时文件，全部成功后再逐个重命名；任何一个临时文件写入失败，
    /// 已有的日期文件都保持不变
    fn persist_by_date(&self, symbol: &str, interval: Interval, new_candles: &[Candle]) -> Result<PersistSummary> {
        let dir = self.series_path(symbol, interval);
        fs::create_dir_all(&dir)
            .map_err(|e| AppError::PersistenceError(format!("创建分区目录失败: {} - {}", dir.display(), e)))?;

        let mut by_date: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
        for candle in new_candles {
            by_date
                .entry(date_key(candle.open_time)?)
                .or_default()
                .push(candle.clone());
        }

        let mut added_rows = 0;
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(by_date.len());
        for (date, candles) in by_date {
            let path = dir.join(format!("{}.csv", date));
            let tmp_path = path.with_extension("csv.tmp");
            let merged = match read_existing(&path) {
                Ok(existing) => {
                    let before = existing.len();
                    let merged = merge_candles(existing, candles);
                    added_rows += merged.len().saturating_sub(before);
                    merged
                }
                Err(e) => {
                    discard_staged(&staged);
                    return Err(e);
                }
            };
            if let Err(e) = write_csv(&tmp_path, &merged) {
                let _ = fs::remove_file(&tmp_path);
                discard_staged(&staged);
                return Err(AppError::PersistenceError(format!("写入分区文件失败: {} - {}", tmp_path.display(), e)));
            }
            staged.push((tmp_path, path));
        }

        for (i, (tmp_path, path)) in staged.iter().enumerate() {
            if let Err(e) = fs::rename(tmp_path, path) {
                discard_staged(&staged[i..]);
                return Err(AppError::PersistenceError(format!(
                    "提交分区文件失败: {} - {}，已提交 {} / {} 个日期",
                    path.display(),
                    e,
                    i,
                    staged.len()
                )));
            }
            debug!(target: "store", "{}/{}: 写入分区文件 {}", symbol, interval, path.display());
        }

        let total_rows = self.load(symbol, interval)?.map_or(0, |c| c.len());
        Ok(PersistSummary { added_rows, total_rows })
    }

    /// 接收推送流的K线，只有已收盘的K线才会写入
    pub fn apply_stream_candle(&self, symbol: &str, interval: Interval, candle: &Candle, is_final: bool) -> Result<bool> {
        if !is_final {
            return Ok(false);
        }
        let summary = self.merge_and_persist(symbol, interval, std::slice::from_ref(candle))?;
        Ok(summary.added_rows > 0)
    }

    /// 接收推送流的原始K线，推送中的周期必须与目标序列一致
    pub fn apply_stream_kline(&self, symbol: &str, interval: Interval, kline: &KlineData) -> Result<bool> {
        let pushed = kline.interval()?;
        if pushed != interval {
            return Err(AppError::ValidationError(format!(
                "推送K线周期 {} 与序列 {}/{} 不一致",
                pushed, symbol, interval
            )));
        }
        self.apply_stream_candle(symbol, interval, &kline.to_candle()?, kline.is_closed)
    }
}

fn read_existing(path: &Path) -> Result<Vec<Candle>> {
    if path.exists() {
        read_csv(path)
    } else {
        Ok(Vec::new())
    }
}

/// 删除尚未提交的临时文件
fn discard_staged(staged: &[(PathBuf, PathBuf)]) {
    for (tmp_path, _) in staged {
        let _ = fs::remove_file(tmp_path);
    }
}

fn validate_symbol(symbol: &str) -> Result<()> {
    if symbol.is_empty() || symbol.contains(['/', '\\', '.']) {
        return Err(AppError::ValidationError(format!("无效的交易对名称: {:?}", symbol)));
    }
    Ok(())
}

/// K线开盘时间对应的UTC日期，格式 YYYYMMDD
fn date_key(open_time: i64) -> Result<String> {
    let dt = Utc
        .timestamp_millis_opt(open_time)
        .single()
        .ok_or_else(|| AppError::DataError(format!("无效的时间戳: {}", open_time)))?;
    Ok(dt.format("%Y%m%d").to_string())
}

fn read_csv(path: &Path) -> Result<Vec<Candle>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;

    let headers = reader.headers()?.clone();
    if headers.iter().map(str::trim).ne(CANDLE_HEADERS.iter().copied()) {
        return Err(AppError::DataError(format!(
            "文件表头与K线格式不一致: {} - {:?}",
            path.display(),
            headers
        )));
    }

    let mut candles = Vec::new();
    for record in reader.records() {
        candles.push(Candle::from_csv_record(&record?)?);
    }
    Ok(candles)
}

fn write_csv(path: &Path, candles: &[Candle]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(CANDLE_HEADERS)?;
    for candle in candles {
        wtr.write_record(&candle.to_csv_record())?;
    }
    wtr.flush()?;
    Ok(())
}

/// 先写同目录下的临时文件再重命名，崩溃时不会留下截断的序列文件
fn write_csv_atomic(path: &Path, candles: &[Candle]) -> Result<()> {
    let tmp_path = path.with_extension("csv.tmp");

    let result = write_csv(&tmp_path, candles).and_then(|_| fs::rename(&tmp_path, path).map_err(AppError::from));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(AppError::PersistenceError(format!("写入序列文件失败: {} - {}", path.display(), e)));
    }
    Ok(())
}
