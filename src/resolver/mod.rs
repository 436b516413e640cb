//! Playlist Resolver: turns a `(catalogueId, kind, season?, episode?)` tuple
//! into an ordered, deduplicated set of [`PlaylistDescriptor`]s.
//!
//! Grounded on the teacher's `hosts/fshare.rs` session-caching provider-
//! client idiom (async_trait handler, `ensure_login`-style lazy warm-up) and
//! `hosts/base.rs`'s `HostHandler` capability trait, re-purposed here for
//! embed-page -> master-manifest resolution instead of file-host link
//! resolution. Manifest parsing itself is grounded on `m3u8-rs`, the crate
//! the HLS-focused reference files in the retrieval pack use for the same
//! job (the teacher never parses adaptive-streaming manifests).

pub mod catalogue;

use crate::config::ExtractorConfig;
use crate::error::EngineError;
use crate::fetch::{body_indicates_challenge, RetryableFetcher};
use crate::model::{PlaylistDescriptor, Quality, SubTaskKind, TaskKind};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of a resolution attempt: either the descriptor set, or a
/// definitive "this content does not exist" signal distinct from a
/// transport failure.
pub enum ResolveOutcome {
    Found {
        descriptors: Vec<PlaylistDescriptor>,
        /// Requested languages that were not present in the manifest, per
        /// kind, preserved for the orchestrator's `missingLanguages`/
        /// `missingSubtitles` metadata.
        missing: Vec<(SubTaskKind, String)>,
    },
    NotFound,
}

/// The handful of variant-stream fields selection logic actually needs,
/// decoupled from `m3u8_rs::VariantStream`'s full field set.
#[derive(Debug, Clone)]
struct ManifestVariant {
    uri: String,
    bandwidth: u64,
    height: Option<u64>,
    codecs: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackMediaType {
    Audio,
    Subtitle,
}

#[derive(Debug, Clone)]
struct ManifestAlternative {
    media_type: TrackMediaType,
    uri: Option<String>,
    language: Option<String>,
}

pub struct PlaylistResolver {
    fetcher: Arc<RetryableFetcher>,
    base_url: String,
}

impl PlaylistResolver {
    pub fn new(fetcher: Arc<RetryableFetcher>, config: &ExtractorConfig) -> Self {
        Self {
            fetcher,
            base_url: config.base_url.clone(),
        }
    }

    fn embed_url(&self, catalogue_id: &str, kind: &TaskKind) -> String {
        match kind {
            TaskKind::Movie => format!("{}/movie/{}", self.base_url.trim_end_matches('/'), catalogue_id),
            TaskKind::Tv { season, episode } => format!(
                "{}/tv/{}/{}/{}",
                self.base_url.trim_end_matches('/'),
                catalogue_id,
                season,
                episode
            ),
        }
    }

    pub async fn resolve(
        &self,
        catalogue_id: &str,
        kind: &TaskKind,
        languages: &[String],
        quality: Quality,
        cancel: &CancellationToken,
    ) -> Result<ResolveOutcome, EngineError> {
        let embed_url = self.embed_url(catalogue_id, kind);

        let embed_resp = self
            .fetcher
            .get(&embed_url, cancel)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if embed_resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(ResolveOutcome::NotFound);
        }

        let body = embed_resp
            .text()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if body_indicates_challenge(&body) {
            warn!(%embed_url, "anti-bot challenge detected while resolving embed page");
            return Err(EngineError::PlaylistExtraction {
                embed_url,
                catalogue_id: Some(catalogue_id.to_string()),
                message: "anti-bot challenge encountered".to_string(),
            });
        }

        if is_not_found_sentinel(&body) {
            return Ok(ResolveOutcome::NotFound);
        }

        let master_url = extract_master_manifest_url(&body).ok_or_else(|| EngineError::PlaylistExtraction {
            embed_url: embed_url.clone(),
            catalogue_id: Some(catalogue_id.to_string()),
            message: "no master manifest URL found in embed page".to_string(),
        })?;

        let master_resp = self
            .fetcher
            .get(&master_url, cancel)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let master_bytes = master_resp
            .bytes()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let playlist = m3u8_rs::parse_playlist_res(&master_bytes).map_err(|_| EngineError::PlaylistExtraction {
            embed_url: embed_url.clone(),
            catalogue_id: Some(catalogue_id.to_string()),
            message: "malformed master manifest".to_string(),
        })?;

        let master = match playlist {
            m3u8_rs::Playlist::MasterPlaylist(m) => m,
            m3u8_rs::Playlist::MediaPlaylist(_) => {
                return Err(EngineError::PlaylistExtraction {
                    embed_url,
                    catalogue_id: Some(catalogue_id.to_string()),
                    message: "expected a master manifest, got a media manifest".to_string(),
                })
            }
        };

        let base = resolve_base(&master_url);

        let variants: Vec<ManifestVariant> = master
            .variants
            .iter()
            .map(|v| ManifestVariant {
                uri: join_url(&base, &v.uri),
                bandwidth: v.bandwidth,
                height: v.resolution.map(|r| r.height),
                codecs: v.codecs.clone(),
            })
            .collect();

        let alternatives: Vec<ManifestAlternative> = master
            .alternatives
            .iter()
            .filter_map(|a| {
                let media_type = match a.media_type {
                    m3u8_rs::AlternativeMediaType::Audio => TrackMediaType::Audio,
                    m3u8_rs::AlternativeMediaType::Subtitles => TrackMediaType::Subtitle,
                    _ => return None,
                };
                Some(ManifestAlternative {
                    media_type,
                    uri: a.uri.as_ref().map(|u| join_url(&base, u)),
                    language: a.language.clone(),
                })
            })
            .collect();

        let video = select_video_variant(&variants, quality).ok_or_else(|| EngineError::PlaylistExtraction {
            embed_url: embed_url.clone(),
            catalogue_id: Some(catalogue_id.to_string()),
            message: "no video variant in manifest".to_string(),
        })?;

        let mut descriptors = vec![video];
        let mut missing = Vec::new();
        for media_type in [TrackMediaType::Audio, TrackMediaType::Subtitle] {
            let (found, miss) = select_language_tracks(&alternatives, media_type, languages);
            missing.extend(miss);
            descriptors.extend(found);
        }

        dedup_by_kind_and_language(&mut descriptors);

        debug!(%catalogue_id, count = descriptors.len(), "resolved playlist descriptors");
        Ok(ResolveOutcome::Found { descriptors, missing })
    }
}

fn dedup_by_kind_and_language(descriptors: &mut Vec<PlaylistDescriptor>) {
    let mut seen = HashSet::new();
    descriptors.retain(|d| seen.insert(d.dedup_key()));
}

fn select_video_variant(variants: &[ManifestVariant], quality: Quality) -> Option<PlaylistDescriptor> {
    if variants.is_empty() {
        return None;
    }
    let chosen = match quality {
        Quality::Best => variants.iter().max_by_key(|v| v.bandwidth)?,
        Quality::Height(target) => variants
            .iter()
            .find(|v| v.height == Some(target as u64))
            .or_else(|| {
                variants
                    .iter()
                    .filter(|v| v.height.map(|h| h <= target as u64).unwrap_or(false))
                    .max_by_key(|v| v.height.unwrap_or(0))
            })
            .or_else(|| variants.iter().max_by_key(|v| v.bandwidth))?,
    };
    Some(PlaylistDescriptor {
        url: chosen.uri.clone(),
        kind: SubTaskKind::Video,
        language: None,
        codec: chosen.codecs.clone(),
        bitrate: Some(chosen.bandwidth),
        resolution: chosen.height.map(|h| format!("{}p", h)),
        verified: false,
    })
}

fn select_language_tracks(
    alternatives: &[ManifestAlternative],
    media_type: TrackMediaType,
    requested_languages: &[String],
) -> (Vec<PlaylistDescriptor>, Vec<(SubTaskKind, String)>) {
    let kind = match media_type {
        TrackMediaType::Audio => SubTaskKind::Audio,
        TrackMediaType::Subtitle => SubTaskKind::Subtitle,
    };

    let mut found = Vec::new();
    let mut missing = Vec::new();

    for lang in requested_languages {
        let track = alternatives.iter().find(|a| {
            a.media_type == media_type
                && a.language.as_deref().map(|l| l.eq_ignore_ascii_case(lang)).unwrap_or(false)
                && a.uri.is_some()
        });
        match track {
            Some(t) => found.push(PlaylistDescriptor {
                url: t.uri.clone().unwrap(),
                kind,
                language: Some(lang.clone()),
                codec: None,
                bitrate: None,
                resolution: None,
                verified: false,
            }),
            None => missing.push((kind, lang.clone())),
        }
    }

    (found, missing)
}

fn resolve_base(manifest_url: &str) -> String {
    match manifest_url.rfind('/') {
        Some(idx) => manifest_url[..=idx].to_string(),
        None => manifest_url.to_string(),
    }
}

fn join_url(base: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        uri.to_string()
    } else {
        format!("{base}{uri}")
    }
}

/// Scrapes a `.m3u8` absolute URL out of an embed page body. Providers
/// typically inline the manifest URL in a script tag; a direct regex search
/// is sufficient and avoids depending on any one page's exact markup.
fn extract_master_manifest_url(body: &str) -> Option<String> {
    static RE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r#"https?://[^\s"'\\]+\.m3u8[^\s"'\\]*"#).unwrap());
    RE.find(body).map(|m| m.as_str().to_string())
}

fn is_not_found_sentinel(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("content not found") || lower.contains("video not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(bandwidth: u64, height: Option<u64>, uri: &str) -> ManifestVariant {
        ManifestVariant {
            uri: uri.to_string(),
            bandwidth,
            height,
            codecs: None,
        }
    }

    #[test]
    fn best_quality_picks_highest_bandwidth() {
        let variants = vec![variant(1000, Some(480), "low.m3u8"), variant(5000, Some(1080), "high.m3u8")];
        let chosen = select_video_variant(&variants, Quality::Best).unwrap();
        assert_eq!(chosen.url, "high.m3u8");
    }

    #[test]
    fn exact_height_match_wins() {
        let variants = vec![variant(1000, Some(480), "low.m3u8"), variant(5000, Some(1080), "high.m3u8")];
        let chosen = select_video_variant(&variants, Quality::Height(480)).unwrap();
        assert_eq!(chosen.url, "low.m3u8");
    }

    #[test]
    fn nearest_not_exceeding_when_no_exact_match() {
        let variants = vec![variant(1000, Some(480), "low.m3u8"), variant(5000, Some(1080), "high.m3u8")];
        let chosen = select_video_variant(&variants, Quality::Height(720)).unwrap();
        assert_eq!(chosen.url, "low.m3u8");
    }

    #[test]
    fn falls_back_to_highest_when_nothing_fits() {
        let variants = vec![variant(1000, Some(1080), "a.m3u8"), variant(5000, Some(2160), "b.m3u8")];
        let chosen = select_video_variant(&variants, Quality::Height(240)).unwrap();
        // no variant has height <= 240, so falls back to max bandwidth
        assert_eq!(chosen.url, "b.m3u8");
    }

    #[test]
    fn extracts_manifest_url_from_embed_page() {
        let body = r#"<script>var src = "https://cdn.example.com/stream/master.m3u8?token=abc";</script>"#;
        assert_eq!(
            extract_master_manifest_url(body).unwrap(),
            "https://cdn.example.com/stream/master.m3u8?token=abc"
        );
    }

    #[test]
    fn missing_embed_manifest_returns_none() {
        assert!(extract_master_manifest_url("<html>nothing here</html>").is_none());
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut descriptors = vec![
            PlaylistDescriptor::audio("a.m3u8", "en"),
            PlaylistDescriptor::audio("b.m3u8", "en"),
        ];
        dedup_by_kind_and_language(&mut descriptors);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].url, "a.m3u8");
    }

    #[test]
    fn missing_language_is_recorded_not_descriptor() {
        let alternatives = vec![ManifestAlternative {
            media_type: TrackMediaType::Audio,
            uri: Some("en.m3u8".to_string()),
            language: Some("en".to_string()),
        }];
        let requested = vec!["en".to_string(), "ja".to_string()];
        let (found, missing) = select_language_tracks(&alternatives, TrackMediaType::Audio, &requested);
        assert_eq!(found.len(), 1);
        assert_eq!(missing, vec![(SubTaskKind::Audio, "ja".to_string())]);
    }
}
