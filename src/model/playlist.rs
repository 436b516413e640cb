use crate::model::SubTaskKind;
use serde::{Deserialize, Serialize};

/// Produced by the Playlist Resolver: a single selected track, ready to be
/// handed to a Segment Downloader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistDescriptor {
    pub url: String,
    pub kind: SubTaskKind,
    pub language: Option<String>,
    pub codec: Option<String>,
    pub bitrate: Option<u64>,
    pub resolution: Option<String>,
    pub verified: bool,
}

impl PlaylistDescriptor {
    pub fn video(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: SubTaskKind::Video,
            language: None,
            codec: None,
            bitrate: None,
            resolution: None,
            verified: false,
        }
    }

    pub fn audio(url: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: SubTaskKind::Audio,
            language: Some(language.into()),
            codec: None,
            bitrate: None,
            resolution: None,
            verified: false,
        }
    }

    pub fn subtitle(url: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: SubTaskKind::Subtitle,
            language: Some(language.into()),
            codec: None,
            bitrate: None,
            resolution: None,
            verified: false,
        }
    }

    /// Deduplication key per the Resolver contract: `(kind, language)`.
    pub fn dedup_key(&self) -> (SubTaskKind, Option<String>) {
        (self.kind, self.language.clone())
    }
}
