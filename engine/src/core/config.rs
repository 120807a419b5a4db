//! Application configuration
//!
//! Layered configuration: built-in defaults, then an optional JSON config
//! file (profile dir or CLI-specified path), then CLI/env overrides.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::cli::CliConfig;
use super::constants::{
    APP_DOT_FOLDER, CONFIG_FILE_NAME, DEFAULT_CAPTURE_INTERVAL_MS, DEFAULT_HOST,
    DEFAULT_PHASH_THRESHOLD, DEFAULT_PORT, DEFAULT_RETENTION_MS,
};

// =============================================================================
// Server
// =============================================================================

/// API server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

// =============================================================================
// Capture
// =============================================================================

/// Capture frontend configuration (C6 defaults; live tuning comes from the
/// backpressure controller on top of these)
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Base interval between capture iterations (ms)
    pub interval_ms: u64,
    /// Hamming-distance threshold for per-source dedup
    pub phash_threshold: u32,
    /// Retention for capture files before the sweep deletes them (ms)
    pub retention_ms: i64,
}

// =============================================================================
// AI Providers
// =============================================================================

/// Connection settings for one model endpoint (OpenAI-compatible)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl ProviderConfig {
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some() && self.model.is_some()
    }
}

/// AI endpoint configuration for the three capabilities
#[derive(Debug, Clone, Default)]
pub struct AiConfig {
    pub vlm: ProviderConfig,
    pub text: ProviderConfig,
    pub embedding: ProviderConfig,
}

// =============================================================================
// OCR
// =============================================================================

#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub enabled: bool,
}

// =============================================================================
// Monitoring
// =============================================================================

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Start the loopback monitoring listener at boot instead of on demand
    pub enabled: bool,
}

// =============================================================================
// File Config (JSON deserialization target)
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServerConfig {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileCaptureConfig {
    interval_ms: Option<u64>,
    phash_threshold: Option<u32>,
    retention_hours: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAiConfig {
    vlm: Option<ProviderConfig>,
    text: Option<ProviderConfig>,
    embedding: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    server: Option<FileServerConfig>,
    capture: Option<FileCaptureConfig>,
    ai: Option<FileAiConfig>,
    ocr_enabled: Option<bool>,
    monitoring_enabled: Option<bool>,
    debug: Option<bool>,
}

impl FileConfig {
    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn merge(&mut self, overlay: FileConfig) {
        if overlay.server.is_some() {
            self.server = overlay.server;
        }
        if overlay.capture.is_some() {
            self.capture = overlay.capture;
        }
        if overlay.ai.is_some() {
            self.ai = overlay.ai;
        }
        if overlay.ocr_enabled.is_some() {
            self.ocr_enabled = overlay.ocr_enabled;
        }
        if overlay.monitoring_enabled.is_some() {
            self.monitoring_enabled = overlay.monitoring_enabled;
        }
        if overlay.debug.is_some() {
            self.debug = overlay.debug;
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Fully resolved application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub ai: AiConfig,
    pub ocr: OcrConfig,
    pub monitoring: MonitoringConfig,
    pub debug: bool,
}

impl AppConfig {
    /// Load configuration from all sources
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. Profile directory config (~/.glimpse/glimpse.json)
    /// 3. Local directory config OR CLI-specified config path
    /// 4. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        tracing::debug!("Loading application configuration");

        let mut file_config = FileConfig::default();
        let mut found_configs: Vec<String> = Vec::new();

        if let Some(profile_path) = profile_config_path()
            && profile_path.exists()
        {
            file_config.merge(FileConfig::load_from_file(&profile_path)?);
            found_configs.push(profile_path.display().to_string());
        }

        let overlay_path = if let Some(ref path) = cli.config {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Some(path.clone())
        } else {
            let local = PathBuf::from(CONFIG_FILE_NAME);
            if local.exists() { Some(local) } else { None }
        };

        if let Some(path) = overlay_path {
            file_config.merge(FileConfig::load_from_file(&path)?);
            found_configs.push(path.display().to_string());
        }

        tracing::debug!(configs = ?found_configs, "Config files loaded");

        let file_server = file_config.server.unwrap_or_default();
        let file_capture = file_config.capture.unwrap_or_default();
        let file_ai = file_config.ai.unwrap_or_default();

        Ok(Self {
            server: ServerConfig {
                host: cli
                    .host
                    .clone()
                    .or(file_server.host)
                    .unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: cli.port.or(file_server.port).unwrap_or(DEFAULT_PORT),
            },
            capture: CaptureConfig {
                interval_ms: cli
                    .capture_interval_ms
                    .or(file_capture.interval_ms)
                    .unwrap_or(DEFAULT_CAPTURE_INTERVAL_MS),
                phash_threshold: cli
                    .phash_threshold
                    .or(file_capture.phash_threshold)
                    .unwrap_or(DEFAULT_PHASH_THRESHOLD),
                retention_ms: file_capture
                    .retention_hours
                    .map(|h| h * 60 * 60 * 1000)
                    .unwrap_or(DEFAULT_RETENTION_MS),
            },
            ai: AiConfig {
                vlm: file_ai.vlm.unwrap_or_default(),
                text: file_ai.text.unwrap_or_default(),
                embedding: file_ai.embedding.unwrap_or_default(),
            },
            ocr: OcrConfig {
                enabled: cli.ocr.or(file_config.ocr_enabled).unwrap_or(false),
            },
            monitoring: MonitoringConfig {
                enabled: cli
                    .monitoring
                    .or(file_config.monitoring_enabled)
                    .unwrap_or(false),
            },
            debug: cli.debug || file_config.debug.unwrap_or(false),
        })
    }
}

fn profile_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(APP_DOT_FOLDER).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_files() {
        let config = AppConfig::load(&CliConfig::default()).unwrap();
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.capture.interval_ms, DEFAULT_CAPTURE_INTERVAL_MS);
        assert_eq!(config.capture.phash_threshold, DEFAULT_PHASH_THRESHOLD);
        assert!(!config.ocr.enabled);
        assert!(!config.monitoring.enabled);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliConfig {
            port: Some(9999),
            phash_threshold: Some(7),
            ..Default::default()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.capture.phash_threshold, 7);
    }

    #[test]
    fn test_file_config_merge() {
        let mut base = FileConfig::default();
        let overlay = FileConfig {
            ocr_enabled: Some(true),
            ..Default::default()
        };
        base.merge(overlay);
        assert_eq!(base.ocr_enabled, Some(true));
        assert!(base.server.is_none());
    }

    #[test]
    fn test_provider_configured() {
        let mut p = ProviderConfig::default();
        assert!(!p.is_configured());
        p.base_url = Some("http://localhost:11434/v1".to_string());
        p.model = Some("qwen2.5-vl".to_string());
        assert!(p.is_configured());
    }
}
