use crate::klcommon::{AppError, Result};
use chrono::{Months, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 持久化文件的固定12列表头
pub const CANDLE_HEADERS: [&str; 12] = [
    "open_time",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "close_time",
    "quote_asset_volume",
    "number_of_trades",
    "taker_buy_base_asset_volume",
    "taker_buy_quote_asset_volume",
    "ignore",
];

/// K线周期，只接受交易所支持的固定集合
///
/// 声明顺序即周期宽度从小到大的顺序，`Ord` 依赖这一点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "3m")]
    Minute3,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "6h")]
    Hour6,
    #[serde(rename = "8h")]
    Hour8,
    #[serde(rename = "12h")]
    Hour12,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "3d")]
    Day3,
    #[serde(rename = "1w")]
    Week1,
    #[serde(rename = "1M")]
    Month1,
}

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

impl Interval {
    pub const ALL: [Interval; 15] = [
        Interval::Minute1,
        Interval::Minute3,
        Interval::Minute5,
        Interval::Minute15,
        Interval::Minute30,
        Interval::Hour1,
        Interval::Hour2,
        Interval::Hour4,
        Interval::Hour6,
        Interval::Hour8,
        Interval::Hour12,
        Interval::Day1,
        Interval::Day3,
        Interval::Week1,
        Interval::Month1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute1 => "1m",
            Interval::Minute3 => "3m",
            Interval::Minute5 => "5m",
            Interval::Minute15 => "15m",
            Interval::Minute30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour2 => "2h",
            Interval::Hour4 => "4h",
            Interval::Hour6 => "6h",
            Interval::Hour8 => "8h",
            Interval::Hour12 => "12h",
            Interval::Day1 => "1d",
            Interval::Day3 => "3d",
            Interval::Week1 => "1w",
            Interval::Month1 => "1M",
        }
    }

    /// 周期对应的毫秒数，`1M` 固定按30天计算
    pub fn duration_ms(&self) -> i64 {
        match self {
            Interval::Minute1 => MINUTE_MS,
            Interval::Minute3 => 3 * MINUTE_MS,
            Interval::Minute5 => 5 * MINUTE_MS,
            Interval::Minute15 => 15 * MINUTE_MS,
            Interval::Minute30 => 30 * MINUTE_MS,
            Interval::Hour1 => HOUR_MS,
            Interval::Hour2 => 2 * HOUR_MS,
            Interval::Hour4 => 4 * HOUR_MS,
            Interval::Hour6 => 6 * HOUR_MS,
            Interval::Hour8 => 8 * HOUR_MS,
            Interval::Hour12 => 12 * HOUR_MS,
            Interval::Day1 => DAY_MS,
            Interval::Day3 => 3 * DAY_MS,
            Interval::Week1 => 7 * DAY_MS,
            Interval::Month1 => 30 * DAY_MS,
        }
    }

    /// 下一根K线的开盘时间；`1M` 按UTC自然月推进
    pub fn next_open_time(&self, open_time: i64) -> i64 {
        if *self == Interval::Month1 {
            if let Some(next) = Utc
                .timestamp_millis_opt(open_time)
                .single()
                .and_then(|dt| dt.checked_add_months(Months::new(1)))
            {
                return next.timestamp_millis();
            }
        }
        open_time + self.duration_ms()
    }
}

impl FromStr for Interval {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Interval::ALL
            .iter()
            .copied()
            .find(|interval| interval.as_str() == s)
            .ok_or_else(|| AppError::ValidationError(format!("无效的K线周期: {}", s)))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次请求覆盖的时间窗口，半开区间 `[start_ms, end_ms)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    pub fn new(start_ms: i64, end_ms: i64) -> Result<Self> {
        if end_ms <= start_ms {
            return Err(AppError::ValidationError(format!(
                "时间窗口结束时间必须大于开始时间: [{}, {})",
                start_ms, end_ms
            )));
        }
        Ok(Self { start_ms, end_ms })
    }

    /// 窗口内可能出现的K线开盘时间个数（向上取整）
    pub fn candle_count(&self, interval_ms: i64) -> i64 {
        let span = self.end_ms - self.start_ms;
        (span + interval_ms - 1) / interval_ms
    }

    /// 交易所的 endTime 参数是闭区间
    pub fn end_inclusive_ms(&self) -> i64 {
        self.end_ms - 1
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start_ms, self.end_ms)
    }
}

/// 一根K线（OHLCV），`open_time` 是序列内的唯一键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// K线开盘时间
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// 成交量
    pub volume: Decimal,
    /// K线收盘时间
    pub close_time: i64,
    /// 报价资产成交量
    pub quote_asset_volume: Decimal,
    /// 成交笔数
    pub number_of_trades: i64,
    /// 主动买入基础资产成交量
    pub taker_buy_base_asset_volume: Decimal,
    /// 主动买入报价资产成交量
    pub taker_buy_quote_asset_volume: Decimal,
    /// 交易所保留字段，原样保存
    pub ignore: String,
}

fn parse_decimal(value: &str, field: &str) -> Result<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| AppError::DataError(format!("字段 {} 无法解析为小数: {} ({})", field, value, e)))
}

fn parse_int(value: &str, field: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|e| AppError::DataError(format!("字段 {} 无法解析为整数: {} ({})", field, value, e)))
}

impl Candle {
    /// 从交易所返回的原始数组创建K线对象
    ///
    /// 价格/成交量字段在接口里是字符串，时间和成交笔数是整数
    pub fn from_raw_kline(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 12 {
            return None;
        }
        let dec = |v: &serde_json::Value| Decimal::from_str(v.as_str()?).ok();

        Some(Self {
            open_time: raw[0].as_i64()?,
            open: dec(&raw[1])?,
            high: dec(&raw[2])?,
            low: dec(&raw[3])?,
            close: dec(&raw[4])?,
            volume: dec(&raw[5])?,
            close_time: raw[6].as_i64()?,
            quote_asset_volume: dec(&raw[7])?,
            number_of_trades: raw[8].as_i64()?,
            taker_buy_base_asset_volume: dec(&raw[9])?,
            taker_buy_quote_asset_volume: dec(&raw[10])?,
            ignore: match &raw[11] {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        })
    }

    /// 转换为CSV记录，列顺序与 `CANDLE_HEADERS` 一致
    pub fn to_csv_record(&self) -> Vec<String> {
        vec![
            self.open_time.to_string(),
            self.open.to_string(),
            self.high.to_string(),
            self.low.to_string(),
            self.close.to_string(),
            self.volume.to_string(),
            self.close_time.to_string(),
            self.quote_asset_volume.to_string(),
            self.number_of_trades.to_string(),
            self.taker_buy_base_asset_volume.to_string(),
            self.taker_buy_quote_asset_volume.to_string(),
            self.ignore.clone(),
        ]
    }

    /// 从CSV记录还原K线
    pub fn from_csv_record(record: &csv::StringRecord) -> Result<Self> {
        if record.len() != CANDLE_HEADERS.len() {
            return Err(AppError::DataError(format!(
                "CSV行列数错误: 期望 {} 列，实际 {} 列",
                CANDLE_HEADERS.len(),
                record.len()
            )));
        }
        let field = |i: usize| record.get(i).unwrap_or_default().trim();

        Ok(Self {
            open_time: parse_int(field(0), CANDLE_HEADERS[0])?,
            open: parse_decimal(field(1), CANDLE_HEADERS[1])?,
            high: parse_decimal(field(2), CANDLE_HEADERS[2])?,
            low: parse_decimal(field(3), CANDLE_HEADERS[3])?,
            close: parse_decimal(field(4), CANDLE_HEADERS[4])?,
            volume: parse_decimal(field(5), CANDLE_HEADERS[5])?,
            close_time: parse_int(field(6), CANDLE_HEADERS[6])?,
            quote_asset_volume: parse_decimal(field(7), CANDLE_HEADERS[7])?,
            number_of_trades: parse_int(field(8), CANDLE_HEADERS[8])?,
            taker_buy_base_asset_volume: parse_decimal(field(9), CANDLE_HEADERS[9])?,
            taker_buy_quote_asset_volume: parse_decimal(field(10), CANDLE_HEADERS[10])?,
            ignore: field(11).to_string(),
        })
    }
}

/// 下载任务，对应一次K线列表请求
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub symbol: String,
    pub interval: Interval,
    pub start_time: Option<i64>, // 可选，如果为None则由交易所决定
    pub end_time: Option<i64>,   // 闭区间
    pub limit: usize,            // 每次请求的K线数量，最大1000
}

impl DownloadTask {
    /// 为时间窗口创建下载任务
    pub fn for_window(symbol: &str, interval: Interval, window: &TimeWindow, limit: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval,
            start_time: Some(window.start_ms),
            end_time: Some(window.end_inclusive_ms()),
            limit,
        }
    }
}

/// K线数据结构（WebSocket推送）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineData {
    #[serde(rename = "t")]
    pub start_time: i64,
    #[serde(rename = "T")]
    pub end_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "n")]
    pub number_of_trades: i64,
    #[serde(rename = "x")]
    pub is_closed: bool,
    #[serde(rename = "q")]
    pub quote_volume: String,
    #[serde(rename = "V")]
    pub taker_buy_volume: String,
    #[serde(rename = "Q")]
    pub taker_buy_quote_volume: String,
    #[serde(rename = "B", default)]
    pub ignore: String,
}

impl KlineData {
    /// 推送中携带的K线周期
    pub fn interval(&self) -> Result<Interval> {
        self.interval.parse()
    }

    /// 转换为标准K线格式
    pub fn to_candle(&self) -> Result<Candle> {
        Ok(Candle {
            open_time: self.start_time,
            open: parse_decimal(&self.open, "open")?,
            high: parse_decimal(&self.high, "high")?,
            low: parse_decimal(&self.low, "low")?,
            close: parse_decimal(&self.close, "close")?,
            volume: parse_decimal(&self.volume, "volume")?,
            close_time: self.end_time,
            quote_asset_volume: parse_decimal(&self.quote_volume, "quote_asset_volume")?,
            number_of_trades: self.number_of_trades,
            taker_buy_base_asset_volume: parse_decimal(&self.taker_buy_volume, "taker_buy_base_asset_volume")?,
            taker_buy_quote_asset_volume: parse_decimal(&self.taker_buy_quote_volume, "taker_buy_quote_asset_volume")?,
            ignore: self.ignore.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interval_parse_and_duration() {
        assert_eq!("1m".parse::<Interval>().unwrap().duration_ms(), 60_000);
        assert_eq!("4h".parse::<Interval>().unwrap().duration_ms(), 4 * 3_600_000);
        assert_eq!("1M".parse::<Interval>().unwrap().duration_ms(), 30 * 86_400_000);
        // 大小写敏感：1m 是分钟，1M 是月
        assert_ne!("1m".parse::<Interval>().unwrap(), "1M".parse::<Interval>().unwrap());
        assert!(matches!("2m".parse::<Interval>(), Err(AppError::ValidationError(_))));
    }

    #[test]
    fn test_next_open_time_follows_calendar_months() {
        let jan = 1_704_067_200_000; // 2024-01-01
        let feb = 1_706_745_600_000; // 2024-02-01
        let mar = 1_709_251_200_000; // 2024-03-01，闰年二月29天
        let apr = 1_711_929_600_000; // 2024-04-01
        assert_eq!(Interval::Month1.next_open_time(jan), feb);
        assert_eq!(Interval::Month1.next_open_time(feb), mar);
        assert_eq!(Interval::Month1.next_open_time(mar), apr);

        assert_eq!(Interval::Hour1.next_open_time(jan), jan + 3_600_000);
        assert_eq!(Interval::Week1.next_open_time(jan), jan + 7 * 86_400_000);
    }

    #[test]
    fn test_time_window_rejects_empty_range() {
        assert!(TimeWindow::new(1000, 1000).is_err());
        assert!(TimeWindow::new(2000, 1000).is_err());

        let window = TimeWindow::new(4000, 5000).unwrap();
        assert_eq!(window.candle_count(1000), 1);
        assert_eq!(window.end_inclusive_ms(), 4999);
    }

    #[test]
    fn test_from_raw_kline() {
        let raw = json!([
            1499040000000i64, "0.01634790", "0.80000000", "0.01575800", "0.01577100",
            "148976.11427815", 1499644799999i64, "2434.19055334", 308,
            "1756.87402397", "28.46694368", "0"
        ]);
        let candle = Candle::from_raw_kline(raw.as_array().unwrap()).unwrap();
        assert_eq!(candle.open_time, 1499040000000);
        assert_eq!(candle.number_of_trades, 308);
        // 小数保留原始精度
        assert_eq!(candle.open.to_string(), "0.01634790");

        let truncated = json!([1499040000000i64, "0.1"]);
        assert!(Candle::from_raw_kline(truncated.as_array().unwrap()).is_none());
    }

    #[test]
    fn test_stream_payload_to_candle() {
        let payload = json!({
            "t": 1_700_000_000_000i64, "T": 1_700_000_059_999i64, "i": "1m",
            "o": "100.5", "c": "101.0", "h": "102.25", "l": "99.75", "v": "12.5",
            "n": 42, "x": true, "q": "1262.5", "V": "6.0", "Q": "606.0", "B": "0"
        });
        let data: KlineData = serde_json::from_value(payload).unwrap();
        let candle = data.to_candle().unwrap();
        assert!(data.is_closed);
        assert_eq!(candle.close_time, 1_700_000_059_999);
        assert_eq!(candle.high.to_string(), "102.25");
        assert_eq!(data.interval().unwrap(), Interval::Minute1);
    }
}
