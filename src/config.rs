//! Layered configuration: built-in defaults -> TOML file -> environment
//! overrides (prefix `STREAMFORGE_`), following the teacher's figment
//! pipeline. Field names mirror the external interfaces table exactly.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub download: DownloadConfig,
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub catalogue: CatalogueConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub movies_path: PathBuf,
    pub tv_shows_path: PathBuf,
    pub temp_path: PathBuf,
    pub parallel_downloads: usize,
    pub segment_concurrency: usize,
    pub default_quality: String,
    pub default_language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
    pub user_agent: String,
    pub retry_delay_ms: u64,
    /// `None` means unbounded ("retry forever until cancelled"), the
    /// explicit config switch called for by the design notes rather than
    /// silently relying on an integer-overflow sentinel.
    pub max_retries: Option<u32>,
    pub max_retry_delay_ms: u64,
    pub retry_backoff_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatalogueConfig {
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download: DownloadConfig {
                movies_path: PathBuf::from("/downloads/movies"),
                tv_shows_path: PathBuf::from("/downloads/tvshows"),
                temp_path: PathBuf::from("/downloads/temp"),
                parallel_downloads: 3,
                segment_concurrency: 5,
                default_quality: "best".to_string(),
                default_language: "en".to_string(),
            },
            extractor: ExtractorConfig {
                base_url: String::new(),
                timeout_seconds: 30,
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                    .to_string(),
                retry_delay_ms: 2000,
                max_retries: None,
                max_retry_delay_ms: 30_000,
                retry_backoff_multiplier: 2.0,
            },
            catalogue: CatalogueConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Priority: `STREAMFORGE_APPDATA_DIR` env var > `./appData`.
pub fn get_appdata_dir() -> PathBuf {
    env::var("STREAMFORGE_APPDATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./appData"))
}

/// Tries `appData/config/config.toml`, falls back to `config.toml` in the
/// working directory.
pub fn get_config_path() -> PathBuf {
    let appdata_config = get_appdata_dir().join("config/config.toml");
    if appdata_config.exists() {
        appdata_config
    } else {
        PathBuf::from("config.toml")
    }
}

pub fn ensure_appdata_dirs() -> std::io::Result<()> {
    let appdata_dir = get_appdata_dir();
    std::fs::create_dir_all(appdata_dir.join("config"))?;
    std::fs::create_dir_all(appdata_dir.join("logs"))?;
    Ok(())
}

/// Loads the layered configuration; fatal (`EngineError::Config`) on a
/// malformed or missing-required-field file, per the error taxonomy.
pub fn load() -> crate::error::EngineResult<Config> {
    let config_path = get_config_path();
    figment::Figment::new()
        .merge(figment::providers::Serialized::defaults(Config::default()))
        .merge(figment::providers::Toml::file(&config_path))
        .merge(figment::providers::Env::prefixed("STREAMFORGE_").split("__"))
        .extract()
        .map_err(|e| crate::error::EngineError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_external_interface_table() {
        let cfg = Config::default();
        assert_eq!(cfg.download.parallel_downloads, 3);
        assert_eq!(cfg.download.segment_concurrency, 5);
        assert_eq!(cfg.download.default_quality, "best");
        assert_eq!(cfg.download.default_language, "en");
        assert_eq!(cfg.extractor.timeout_seconds, 30);
        assert_eq!(cfg.extractor.retry_delay_ms, 2000);
        assert!(cfg.extractor.max_retries.is_none());
        assert_eq!(cfg.extractor.max_retry_delay_ms, 30_000);
        assert_eq!(cfg.extractor.retry_backoff_multiplier, 2.0);
        assert!(cfg.catalogue.api_key.is_empty());
    }
}
