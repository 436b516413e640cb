//! Metadata catalogue client contract (external collaborator, §6
//! `catalogue.apiKey`). Used only to populate a Task's display attributes
//! (title, year, episode name) after resolution — never to drive playlist
//! resolution or search, which stay out of scope.
//!
//! Grounded on the teacher's `services/tmdb_service.rs` TMDB client, trimmed
//! to the handful of fields this spec's data model actually carries.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::model::TaskKind;

#[derive(Debug, Clone, Default)]
pub struct CatalogueInfo {
    pub title: Option<String>,
    pub year: Option<i32>,
    pub episode_name: Option<String>,
}

#[async_trait]
pub trait CatalogueClient: Send + Sync {
    async fn title_info(&self, catalogue_id: &str, kind: &TaskKind) -> CatalogueInfo;
}

/// Returns empty info unconditionally — the behaviour the config table
/// promises when `catalogue.apiKey` is empty ("resolver uses only
/// user-supplied titles").
pub struct NoopCatalogueClient;

#[async_trait]
impl CatalogueClient for NoopCatalogueClient {
    async fn title_info(&self, _catalogue_id: &str, _kind: &TaskKind) -> CatalogueInfo {
        CatalogueInfo::default()
    }
}

const TMDB_API_BASE: &str = "https://api.themoviedb.org/3";

pub struct TmdbCatalogueClient {
    client: reqwest::Client,
    api_key: String,
}

impl TmdbCatalogueClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MovieResponse {
    title: Option<String>,
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TvResponse {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EpisodeResponse {
    name: Option<String>,
}

#[async_trait]
impl CatalogueClient for TmdbCatalogueClient {
    async fn title_info(&self, catalogue_id: &str, kind: &TaskKind) -> CatalogueInfo {
        match kind {
            TaskKind::Movie => {
                let url = format!("{TMDB_API_BASE}/movie/{catalogue_id}?api_key={}", self.api_key);
                match self.client.get(&url).send().await {
                    Ok(resp) => match resp.json::<MovieResponse>().await {
                        Ok(body) => CatalogueInfo {
                            title: body.title,
                            year: body.release_date.as_deref().and_then(|d| d.get(0..4)).and_then(|y| y.parse().ok()),
                            episode_name: None,
                        },
                        Err(_) => CatalogueInfo::default(),
                    },
                    Err(_) => CatalogueInfo::default(),
                }
            }
            TaskKind::Tv { season, episode } => {
                let tv_url = format!("{TMDB_API_BASE}/tv/{catalogue_id}?api_key={}", self.api_key);
                let ep_url = format!(
                    "{TMDB_API_BASE}/tv/{catalogue_id}/season/{season}/episode/{episode}?api_key={}",
                    self.api_key
                );

                let title = match self.client.get(&tv_url).send().await {
                    Ok(resp) => resp.json::<TvResponse>().await.ok().and_then(|b| b.name),
                    Err(_) => None,
                };
                let episode_name = match self.client.get(&ep_url).send().await {
                    Ok(resp) => resp.json::<EpisodeResponse>().await.ok().and_then(|b| b.name),
                    Err(_) => None,
                };

                CatalogueInfo {
                    title,
                    year: None,
                    episode_name,
                }
            }
        }
    }
}

/// Builds the configured client: TMDB-backed when `api_key` is non-empty,
/// a no-op otherwise.
pub fn build_catalogue_client(api_key: &str) -> Arc<dyn CatalogueClient> {
    if api_key.is_empty() {
        Arc::new(NoopCatalogueClient)
    } else {
        Arc::new(TmdbCatalogueClient::new(api_key.to_string()))
    }
}
