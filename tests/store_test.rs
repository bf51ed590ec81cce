//! 序列存储集成测试：按日期分区、推送流写入、文件格式校验

mod common;

use common::{candle, series, SYMBOL};
use kline_backfill::klcommon::{AppError, Interval, KlineData, StorageLayout};
use kline_backfill::kldata::SeriesStore;

const HOUR: i64 = 3_600_000;
// 2024-01-01 00:00:00 UTC
const DAY_START: i64 = 1_704_067_200_000;

#[test]
fn test_per_date_layout_splits_by_utc_day() {
    let dir = tempfile::tempdir().unwrap();
    let store = SeriesStore::new(dir.path(), StorageLayout::PerDate);
    let candles = series(DAY_START, DAY_START + 60 * HOUR, Interval::Hour1);

    let summary = store.merge_and_persist(SYMBOL, Interval::Hour1, &candles).unwrap();
    assert_eq!(summary.added_rows, 60);
    assert_eq!(summary.total_rows, 60);

    let series_dir = store.series_path(SYMBOL, Interval::Hour1);
    let mut files: Vec<String> = std::fs::read_dir(&series_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files, vec!["20240101.csv", "20240102.csv", "20240103.csv"]);

    let loaded = store.load(SYMBOL, Interval::Hour1).unwrap().unwrap();
    assert_eq!(loaded, candles);
    assert_eq!(store.last_open_time(SYMBOL, Interval::Hour1).unwrap(), Some(DAY_START + 59 * HOUR));
}

#[test]
fn test_per_date_layout_merges_into_existing_day() {
    let dir = tempfile::tempdir().unwrap();
    let store = SeriesStore::new(dir.path(), StorageLayout::PerDate);
    let day = series(DAY_START, DAY_START + 24 * HOUR, Interval::Hour1);

    store.merge_and_persist(SYMBOL, Interval::Hour1, &day[..12]).unwrap();
    let summary = store.merge_and_persist(SYMBOL, Interval::Hour1, &day[6..]).unwrap();

    assert_eq!(summary.added_rows, 12);
    assert_eq!(summary.total_rows, 24);
    assert_eq!(store.load(SYMBOL, Interval::Hour1).unwrap().unwrap(), day);
}

#[test]
fn test_stream_candle_seeds_series_only_when_closed() {
    let dir = tempfile::tempdir().unwrap();
    let store = SeriesStore::new(dir.path(), StorageLayout::PerSeries);

    let payload = r#"{
        "t": 1704067200000, "T": 1704067259999, "s": "BTCUSDT", "i": "1m",
        "f": 100, "L": 200, "o": "42000.10", "c": "42010.00", "h": "42020.50",
        "l": "41990.00", "v": "12.345", "n": 101, "x": false, "q": "518400.12",
        "V": "6.100", "Q": "256000.00", "B": "0"
    }"#;
    let mut kline: KlineData = serde_json::from_str(payload).unwrap();

    assert!(!store.apply_stream_kline(SYMBOL, Interval::Minute1, &kline).unwrap());
    assert!(store.load(SYMBOL, Interval::Minute1).unwrap().is_none());

    kline.is_closed = true;
    let closed = kline.to_candle().unwrap();
    assert!(store.apply_stream_kline(SYMBOL, Interval::Minute1, &kline).unwrap());
    // 重复推送不会新增
    assert!(!store.apply_stream_candle(SYMBOL, Interval::Minute1, &closed, true).unwrap());

    let stored = store.load(SYMBOL, Interval::Minute1).unwrap().unwrap();
    assert_eq!(stored, vec![closed]);
    assert_eq!(stored[0].close.to_string(), "42010.00");
}

#[test]
fn test_stream_kline_for_other_interval_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = SeriesStore::new(dir.path(), StorageLayout::PerSeries);

    let payload = r#"{
        "t": 1704067200000, "T": 1704070799999, "i": "1h",
        "o": "42000.10", "c": "42010.00", "h": "42020.50", "l": "41990.00",
        "v": "12.345", "n": 101, "x": true, "q": "518400.12", "V": "6.100", "Q": "256000.00"
    }"#;
    let kline: KlineData = serde_json::from_str(payload).unwrap();

    let err = store.apply_stream_kline(SYMBOL, Interval::Minute1, &kline).unwrap_err();
    assert!(matches!(err, AppError::ValidationError(_)));
    assert!(store.load(SYMBOL, Interval::Minute1).unwrap().is_none());

    assert!(store.apply_stream_kline(SYMBOL, Interval::Hour1, &kline).unwrap());
}

#[test]
fn test_per_date_write_is_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = SeriesStore::new(dir.path(), StorageLayout::PerDate);
    let candles = series(DAY_START, DAY_START + 60 * HOUR, Interval::Hour1);
    store.merge_and_persist(SYMBOL, Interval::Hour1, &candles[..12]).unwrap();

    let series_dir = store.series_path(SYMBOL, Interval::Hour1);
    let first_day = series_dir.join("20240101.csv");
    let before = std::fs::read(&first_day).unwrap();
    // 第三天的临时文件路径被目录占用，该日期无法写入
    std::fs::create_dir(series_dir.join("20240103.csv.tmp")).unwrap();

    let err = store.merge_and_persist(SYMBOL, Interval::Hour1, &candles[12..]).unwrap_err();
    assert!(matches!(err, AppError::PersistenceError(_)));

    assert_eq!(std::fs::read(&first_day).unwrap(), before);
    let mut files: Vec<String> = std::fs::read_dir(&series_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files, vec!["20240101.csv", "20240103.csv.tmp"]);
    assert_eq!(store.load(SYMBOL, Interval::Hour1).unwrap().unwrap(), candles[..12].to_vec());
}

#[test]
fn test_decimal_precision_survives_csv() {
    let dir = tempfile::tempdir().unwrap();
    let store = SeriesStore::new(dir.path(), StorageLayout::PerSeries);
    let mut c = candle(0, Interval::Minute1);
    c.volume = "0.00012300".parse().unwrap();

    store.merge_and_persist(SYMBOL, Interval::Minute1, &[c.clone()]).unwrap();

    let stored = store.load(SYMBOL, Interval::Minute1).unwrap().unwrap();
    assert_eq!(stored[0].volume.to_string(), "0.00012300");
    assert_eq!(stored, vec![c]);
}

#[test]
fn test_rejects_file_with_foreign_header() {
    let dir = tempfile::tempdir().unwrap();
    let store = SeriesStore::new(dir.path(), StorageLayout::PerSeries);
    std::fs::write(store.series_path(SYMBOL, Interval::Minute1), "time,price\n0,1\n").unwrap();

    let err = store.load(SYMBOL, Interval::Minute1).unwrap_err();
    assert!(matches!(err, AppError::DataError(_)));
}

#[test]
fn test_rejects_path_like_symbols() {
    let dir = tempfile::tempdir().unwrap();
    let store = SeriesStore::new(dir.path(), StorageLayout::PerSeries);

    let err = store.merge_and_persist("../BTCUSDT", Interval::Minute1, &[candle(0, Interval::Minute1)]).unwrap_err();
    assert!(matches!(err, AppError::ValidationError(_)));
}
