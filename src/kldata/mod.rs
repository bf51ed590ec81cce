// 导出数据补齐相关模块
pub mod backfill;
pub mod fetcher;
pub mod gap;
pub mod partitioner;
pub mod store;

// 重新导出常用类型，方便使用
pub use backfill::{BackfillOutcome, FetchedRange, KlineBackfiller, RunReport, RunStatus};
pub use fetcher::{RateLimitedFetcher, RequestStats};
pub use gap::{find_gaps, DataGap, GapHealer, HealOutcome};
pub use partitioner::partition;
pub use store::{merge_candles, PersistSummary, SeriesStore};
