use crate::statemachine::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Discriminated result of any track-level operation (Segment Downloader,
/// Muxer Supervisor, Track Orchestrator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failed,
    NotFound,
    Cancelled,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResult {
    pub status: ResultStatus,
    pub message: Option<String>,
    pub cause: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DownloadResult {
    pub fn success() -> Self {
        Self {
            status: ResultStatus::Success,
            message: None,
            cause: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            message: Some(message.into()),
            cause: None,
            metadata: HashMap::new(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::NotFound,
            message: Some(message.into()),
            cause: None,
            metadata: HashMap::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: ResultStatus::Cancelled,
            message: None,
            cause: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ResultStatus::Success | ResultStatus::Partial)
    }
}

/// Immutable snapshot emitted onto the Progress Bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub sub_task_id: Option<String>,
    pub status: Status,
    /// 0..100, `None` when unknown (e.g. no bytes/duration information yet).
    pub progress: Option<f64>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    /// Human-readable speed string (e.g. "1.50 MB/s"), matching the
    /// on-the-wire envelope contract in the external interfaces section.
    pub download_speed: Option<String>,
    pub eta_seconds: Option<f64>,
    pub message: Option<String>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    pub fn new(task_id: impl Into<String>, status: Status) -> Self {
        Self {
            task_id: task_id.into(),
            sub_task_id: None,
            status,
            progress: None,
            downloaded_bytes: None,
            total_bytes: None,
            download_speed: None,
            eta_seconds: None,
            message: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_sub_task(mut self, sub_task_id: impl Into<String>) -> Self {
        self.sub_task_id = Some(sub_task_id.into());
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress.clamp(0.0, 100.0));
        self
    }

    pub fn with_bytes(mut self, downloaded: u64, total: Option<u64>) -> Self {
        self.downloaded_bytes = Some(downloaded);
        self.total_bytes = total;
        self
    }

    pub fn with_speed(mut self, speed: impl Into<String>) -> Self {
        self.download_speed = Some(speed.into());
        self
    }

    pub fn with_eta(mut self, eta_seconds: f64) -> Self {
        self.eta_seconds = Some(eta_seconds);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// A status transition or a terminal status must always be delivered by
    /// a rate-limiting publisher (see the Progress Bus guard).
    pub fn is_always_delivered(&self) -> bool {
        self.status.is_terminal()
    }
}
