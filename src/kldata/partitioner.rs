use crate::klcommon::{AppError, Result, TimeWindow};

/// 将 `[start_ms, end_ms)` 切分为按时间升序、互不重叠的请求窗口
///
/// 每个窗口最多覆盖 `max_rows_per_request` 根K线；最后一个窗口的结束时间
/// 直接截到 `end_ms`，不按窗口边界取整。`start_ms >= end_ms` 时返回空序列，
/// 表示没有需要补齐的数据
pub fn partition(
    start_ms: i64,
    end_ms: i64,
    interval_ms: i64,
    max_rows_per_request: usize,
) -> Result<Vec<TimeWindow>> {
    if interval_ms <= 0 {
        return Err(AppError::ValidationError(format!("周期毫秒数必须大于0: {}", interval_ms)));
    }
    if max_rows_per_request == 0 {
        return Err(AppError::ValidationError("max_rows_per_request 必须大于0".to_string()));
    }
    if start_ms >= end_ms {
        return Ok(Vec::new());
    }

    let step = interval_ms
        .checked_mul(max_rows_per_request as i64)
        .ok_or_else(|| AppError::ValidationError("窗口跨度溢出".to_string()))?;

    let mut windows = Vec::with_capacity(((end_ms - start_ms) / step + 1) as usize);
    let mut window_start = start_ms;
    while window_start < end_ms {
        let window_end = window_start.saturating_add(step).min(end_ms);
        windows.push(TimeWindow::new(window_start, window_end)?);
        window_start = window_end;
    }

    Ok(windows)
}
