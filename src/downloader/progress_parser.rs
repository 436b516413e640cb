//! Stateful, line-oriented parser turning muxer stderr into progress
//! samples. The muxer contract (external tool, §4.6) guarantees a
//! `Duration:` line early and recurring `frame=... size=... time=...
//! bitrate=...` lines; this parser recognises exactly those two shapes and
//! returns `None` for anything else.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::downloader::progress_math::percentage_by_time;

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Duration:\s*(\d{2}):(\d{2}):(\d{2})\.(\d{2})").unwrap());

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"size=\s*(?P<size>\d+)(?P<unit>kB|KB|kb|mB|MB|mb|B)?.*?time=(?P<h>\d{2}):(?P<m>\d{2}):(?P<s>\d{2})\.(?P<cs>\d{2}).*?bitrate=\s*(?P<bitrate>[\d.]+\s*\S+)",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq)]
pub struct MuxProgressSample {
    pub downloaded_bytes: u64,
    pub bitrate: String,
    /// `None` when `totalDurationSeconds` is not yet known.
    pub progress: Option<f64>,
    pub current_seconds: f64,
}

/// `reset()` must be called between muxer invocations within the same
/// process; parsing before the first `reset()` (or after one invocation's
/// output without resetting) carries over stale `total_duration_seconds`.
#[derive(Debug, Default)]
pub struct ProgressParser {
    total_duration_seconds: Option<f64>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.total_duration_seconds = None;
    }

    pub fn parse_line(&mut self, line: &str) -> Option<MuxProgressSample> {
        if let Some(caps) = DURATION_RE.captures(line) {
            if line.contains("N/A") {
                return None;
            }
            let h: f64 = caps[1].parse().ok()?;
            let m: f64 = caps[2].parse().ok()?;
            let s: f64 = caps[3].parse().ok()?;
            let cs: f64 = caps[4].parse().ok()?;
            self.total_duration_seconds = Some(h * 3600.0 + m * 60.0 + s + cs / 100.0);
            return None;
        }

        let caps = PROGRESS_RE.captures(line)?;
        let size: u64 = caps.name("size")?.as_str().parse().ok()?;
        let unit = caps.name("unit").map(|m| m.as_str()).unwrap_or("B");
        let downloaded_bytes = size * unit_multiplier(unit);

        let h: f64 = caps.name("h")?.as_str().parse().ok()?;
        let m: f64 = caps.name("m")?.as_str().parse().ok()?;
        let s: f64 = caps.name("s")?.as_str().parse().ok()?;
        let cs: f64 = caps.name("cs")?.as_str().parse().ok()?;
        let current_seconds = h * 3600.0 + m * 60.0 + s + cs / 100.0;

        let bitrate = caps.name("bitrate")?.as_str().trim().to_string();

        let progress = self
            .total_duration_seconds
            .map(|total| percentage_by_time(current_seconds, total));

        Some(MuxProgressSample {
            downloaded_bytes,
            bitrate,
            progress,
            current_seconds,
        })
    }
}

/// `kB|KB|kb ≡ 1024`, `mB|MB|mb ≡ 1024²`. This matches the muxer's emitted
/// units (binary, despite the lowercase-k decimal convention elsewhere) and
/// intentionally diverges from the decimal formatter used for display —
/// see the design notes' open question on this exact ambiguity.
fn unit_multiplier(unit: &str) -> u64 {
    match unit {
        "kB" | "KB" | "kb" => 1024,
        "mB" | "MB" | "mb" => 1024 * 1024,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_line_sets_state_but_yields_no_sample() {
        let mut p = ProgressParser::new();
        assert!(p.parse_line("Duration: 00:01:30.50, start: 0.000000, bitrate: 128 kb/s").is_none());
        assert_eq!(p.total_duration_seconds, Some(90.5));
    }

    #[test]
    fn duration_na_is_ignored() {
        let mut p = ProgressParser::new();
        assert!(p.parse_line("Duration: N/A, start: 0.000000, bitrate: N/A").is_none());
        assert!(p.total_duration_seconds.is_none());
    }

    #[test]
    fn progress_line_without_duration_has_no_percentage() {
        let mut p = ProgressParser::new();
        let sample = p
            .parse_line("frame=  120 fps= 30 q=-1.0 size=    2048kB time=00:00:45.00 bitrate= 373.0kbits/s")
            .unwrap();
        assert_eq!(sample.downloaded_bytes, 2048 * 1024);
        assert!(sample.progress.is_none());
        assert!((sample.current_seconds - 45.0).abs() < 0.01);
    }

    #[test]
    fn progress_line_with_known_duration_computes_percentage() {
        let mut p = ProgressParser::new();
        p.parse_line("Duration: 00:01:30.00, start: 0.000000, bitrate: 128 kb/s");
        let sample = p
            .parse_line("frame=  120 fps= 30 q=-1.0 size=    2048kB time=00:00:45.00 bitrate= 373.0kbits/s")
            .unwrap();
        assert!((sample.progress.unwrap() - 50.0).abs() < 0.01);
    }

    #[test]
    fn unrelated_line_yields_nothing() {
        let mut p = ProgressParser::new();
        assert!(p.parse_line("Stream mapping:").is_none());
    }

    #[test]
    fn reset_clears_latent_duration_state() {
        let mut p = ProgressParser::new();
        p.parse_line("Duration: 00:01:30.00, start: 0.000000, bitrate: 128 kb/s");
        p.reset();
        let sample = p
            .parse_line("frame=  120 fps= 30 q=-1.0 size=    2048kB time=00:00:45.00 bitrate= 373.0kbits/s")
            .unwrap();
        assert!(sample.progress.is_none());
    }

    #[test]
    fn identical_input_after_reset_yields_identical_output() {
        let mut p = ProgressParser::new();
        p.parse_line("Duration: 00:01:30.00, start: 0.000000, bitrate: 128 kb/s");
        let first = p
            .parse_line("frame=  120 fps= 30 q=-1.0 size=    2048kB time=00:00:45.00 bitrate= 373.0kbits/s")
            .unwrap();
        p.reset();
        p.parse_line("Duration: 00:01:30.00, start: 0.000000, bitrate: 128 kb/s");
        let second = p
            .parse_line("frame=  120 fps= 30 q=-1.0 size=    2048kB time=00:00:45.00 bitrate= 373.0kbits/s")
            .unwrap();
        assert_eq!(first, second);
    }
}
