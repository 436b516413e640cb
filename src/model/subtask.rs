use crate::statemachine::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Bare kind tag, used where only the discriminant matters (playlist
/// deduplication, muxer input ordering) without the per-kind payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubTaskKind {
    Video,
    Audio,
    Subtitle,
}

/// Tagged variant over the three track kinds, per the design note preferring
/// this over an enum-plus-conditional-behaviour shape: each variant carries
/// exactly the fields meaningful to it (video has no language, audio/subtitle
/// have no resolution) and exposes a small capability set used by the Muxer
/// Supervisor and path construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum SubTaskVariant {
    Video {
        resolution: Option<String>,
        bitrate: Option<u64>,
    },
    Audio {
        language: String,
    },
    Subtitle {
        language: String,
    },
}

impl SubTaskVariant {
    pub fn kind(&self) -> SubTaskKind {
        match self {
            SubTaskVariant::Video { .. } => SubTaskKind::Video,
            SubTaskVariant::Audio { .. } => SubTaskKind::Audio,
            SubTaskVariant::Subtitle { .. } => SubTaskKind::Subtitle,
        }
    }

    pub fn language(&self) -> Option<&str> {
        match self {
            SubTaskVariant::Video { .. } => None,
            SubTaskVariant::Audio { language } | SubTaskVariant::Subtitle { language } => {
                Some(language.as_str())
            }
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            SubTaskVariant::Video { resolution, .. } => match resolution {
                Some(r) => format!("video ({r})"),
                None => "video".to_string(),
            },
            SubTaskVariant::Audio { language } => format!("audio ({language})"),
            SubTaskVariant::Subtitle { language } => format!("subtitle ({language})"),
        }
    }

    /// Temp-file extension per the on-disk layout contract
    /// (`video.ts`, `audio.<lang>.ts`, `sub.<lang>.vtt`).
    pub fn output_extension(&self) -> &'static str {
        match self {
            SubTaskVariant::Video { .. } | SubTaskVariant::Audio { .. } => "ts",
            SubTaskVariant::Subtitle { .. } => "vtt",
        }
    }

    pub fn temp_file_name(&self) -> String {
        match self {
            SubTaskVariant::Video { .. } => format!("video.{}", self.output_extension()),
            SubTaskVariant::Audio { language } => {
                format!("audio.{}.{}", language, self.output_extension())
            }
            SubTaskVariant::Subtitle { language } => {
                format!("sub.{}.{}", language, self.output_extension())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub task_id: String,
    pub variant: SubTaskVariant,
    pub codec: Option<String>,
    pub playlist_url: String,
    pub temp_file_path: PathBuf,
    pub status: Status,
    /// 0..100
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// bytes/s
    pub download_speed: f64,
    pub eta_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubTask {
    pub fn new(
        task_id: impl Into<String>,
        variant: SubTaskVariant,
        codec: Option<String>,
        playlist_url: impl Into<String>,
        temp_dir: &std::path::Path,
    ) -> Self {
        let temp_file_path = temp_dir.join(variant.temp_file_name());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            variant,
            codec,
            playlist_url: playlist_url.into(),
            temp_file_path,
            status: Status::Queued,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            download_speed: 0.0,
            eta_seconds: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn kind(&self) -> SubTaskKind {
        self.variant.kind()
    }

    pub fn language(&self) -> Option<&str> {
        self.variant.language()
    }

    /// Once terminal, `progress`/`downloaded_bytes`/`status` are frozen —
    /// callers must not mutate a SubTask past this point.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
