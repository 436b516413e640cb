//! Pure byte/time/percentage arithmetic shared by every layer that reports
//! progress (Segment Downloader, Muxer Supervisor via Progress Parser,
//! Progress Aggregator). Grounded on the teacher's `DownloadProgress` update
//! math, generalised so percentage can also be driven by media time when no
//! byte totals are known (muxing).

/// `downloaded / max(1, elapsed)`.
pub fn speed_bytes_per_sec(downloaded_bytes: u64, elapsed_seconds: f64) -> f64 {
    (downloaded_bytes as f64 / elapsed_seconds.max(1.0)).max(0.0)
}

/// `None` unless speed is positive and a total is known.
pub fn eta_seconds(downloaded_bytes: u64, total_bytes: Option<u64>, speed_bps: f64) -> Option<f64> {
    let total = total_bytes?;
    if speed_bps <= 0.0 {
        return None;
    }
    let remaining = total.saturating_sub(downloaded_bytes);
    Some((remaining as f64 / speed_bps).max(0.0))
}

/// Percentage by bytes when totals are known, clamped to `[0, 100]`.
pub fn percentage_by_bytes(downloaded_bytes: u64, total_bytes: u64) -> f64 {
    if total_bytes == 0 {
        return if downloaded_bytes > 0 { 100.0 } else { 0.0 };
    }
    ((downloaded_bytes as f64 / total_bytes as f64) * 100.0).clamp(0.0, 100.0)
}

/// Percentage by elapsed media time over a known total duration (muxing).
pub fn percentage_by_time(current_seconds: f64, total_seconds: f64) -> f64 {
    if total_seconds <= 0.0 {
        return 0.0;
    }
    ((current_seconds / total_seconds) * 100.0).clamp(0.0, 100.0)
}

/// One sub-task's contribution to the weighted task-level average: its
/// progress plus the weight (its `total_bytes`, when known) to use.
#[derive(Debug, Clone, Copy)]
pub struct WeightedProgress {
    pub progress: f64,
    pub weight: Option<u64>,
}

/// Weighted average of sub-task percentages, weighted by `total_bytes`; when
/// no weights are known at all, falls back to the arithmetic mean. Byte
/// totals themselves aggregate by straight sum (left to the caller).
pub fn aggregate_progress(parts: &[WeightedProgress]) -> f64 {
    if parts.is_empty() {
        return 0.0;
    }
    let total_weight: u64 = parts.iter().filter_map(|p| p.weight).sum();
    if total_weight > 0 {
        let weighted_sum: f64 = parts
            .iter()
            .map(|p| p.progress * p.weight.unwrap_or(0) as f64)
            .sum();
        (weighted_sum / total_weight as f64).clamp(0.0, 100.0)
    } else {
        let sum: f64 = parts.iter().map(|p| p.progress).sum();
        (sum / parts.len() as f64).clamp(0.0, 100.0)
    }
}

/// Human-readable speed string for the wire envelope, e.g. `"1.50 MB/s"`.
pub fn format_speed(bps: f64) -> String {
    if bps >= 1_000_000_000.0 {
        format!("{:.2} GB/s", bps / 1_000_000_000.0)
    } else if bps >= 1_000_000.0 {
        format!("{:.2} MB/s", bps / 1_000_000.0)
    } else if bps >= 1_000.0 {
        format!("{:.2} KB/s", bps / 1_000.0)
    } else {
        format!("{bps:.0} B/s")
    }
}

/// Human-readable duration string for ETA display.
pub fn format_duration(seconds: f64) -> String {
    let secs = seconds.max(0.0) as u64;
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_and_eta_basic() {
        let speed = speed_bytes_per_sec(500, 1.0);
        assert!((speed - 500.0).abs() < 0.01);
        let eta = eta_seconds(500, Some(1000), speed).unwrap();
        assert!((eta - 1.0).abs() < 0.01);
    }

    #[test]
    fn eta_unknown_without_total() {
        assert!(eta_seconds(500, None, 500.0).is_none());
    }

    #[test]
    fn eta_unknown_with_zero_speed() {
        assert!(eta_seconds(0, Some(1000), 0.0).is_none());
    }

    #[test]
    fn percentage_by_bytes_zero_total_is_0_until_complete_then_100() {
        assert_eq!(percentage_by_bytes(0, 0), 0.0);
        assert_eq!(percentage_by_bytes(1, 0), 100.0);
    }

    #[test]
    fn percentage_by_bytes_clamped() {
        assert_eq!(percentage_by_bytes(2000, 1000), 100.0);
    }

    #[test]
    fn aggregate_progress_weighted_by_bytes() {
        let parts = [
            WeightedProgress { progress: 100.0, weight: Some(100) },
            WeightedProgress { progress: 0.0, weight: Some(900) },
        ];
        // video (900 bytes) at 0%, audio (100 bytes) at 100% -> 10%
        assert!((aggregate_progress(&parts) - 10.0).abs() < 0.01);
    }

    #[test]
    fn aggregate_progress_falls_back_to_mean_without_weights() {
        let parts = [
            WeightedProgress { progress: 50.0, weight: None },
            WeightedProgress { progress: 100.0, weight: None },
        ];
        assert!((aggregate_progress(&parts) - 75.0).abs() < 0.01);
    }

    #[test]
    fn format_speed_buckets() {
        assert_eq!(format_speed(500.0), "500 B/s");
        assert_eq!(format_speed(1_500.0), "1.50 KB/s");
        assert_eq!(format_speed(1_500_000.0), "1.50 MB/s");
    }

    #[test]
    fn format_duration_buckets() {
        assert_eq!(format_duration(45.0), "45s");
        assert_eq!(format_duration(125.0), "2m 5s");
        assert_eq!(format_duration(3725.0), "1h 2m");
    }
}
