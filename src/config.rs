//! Configuration loading and management
//!
//! Settings are organized per subsystem (HTTP pipeline, crawler, logging)
//! and persisted as a single JSON document under the user's configuration
//! directory. Defaults live in one constants module so every `Default`
//! impl draws from the same source.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

/// Default values shared by the `Default` impls below.
pub mod defaults {
    pub const USER_AGENT: &str = "sitefetch/0.2 (Site Inventory Tool)";
    pub const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
    pub const TIMEOUT_SECONDS: u64 = 30;
    pub const FOLLOW_REDIRECTS: bool = true;
    pub const CURL_CAPTURE_FILE: &str = "curl_command.txt";
    pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
    pub const RETRY_MAX_DELAY_MS: u64 = 30_000;
    pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
    pub const BREAKER_BREAK_SECONDS: u64 = 30;

    pub const MAX_PAGES: usize = 100;
    pub const MAX_DEPTH: u32 = 3;
    pub const REQUEST_DELAY_MS: u64 = 1_000;
    pub const MAX_REQUESTS_PER_SECOND: u32 = 5;
    pub const OUTPUT_DIRECTORY: &str = "crawl-output";

    pub const LOG_LEVEL: &str = "info";
}

/// HTTP pipeline settings: client construction plus the retry and
/// circuit-breaker thresholds the decorators read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub follow_redirects: bool,
    pub accept_language: String,
    /// Where the most recent outbound call is captured as a curl command,
    /// overwritten on each call. `None` disables the capture.
    pub curl_capture_path: Option<PathBuf>,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_break_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::USER_AGENT.to_string(),
            timeout_seconds: defaults::TIMEOUT_SECONDS,
            follow_redirects: defaults::FOLLOW_REDIRECTS,
            accept_language: defaults::ACCEPT_LANGUAGE.to_string(),
            curl_capture_path: Some(PathBuf::from(defaults::CURL_CAPTURE_FILE)),
            retry_base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            breaker_failure_threshold: defaults::BREAKER_FAILURE_THRESHOLD,
            breaker_break_seconds: defaults::BREAKER_BREAK_SECONDS,
        }
    }
}

/// Crawler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Caps total fetched pages.
    pub max_pages: usize,
    /// Caps link-following depth; the seed is depth 0.
    pub max_depth: u32,
    /// Politeness delay between fetches in milliseconds.
    pub request_delay_ms: u64,
    /// Persist raw HTML of fetched pages.
    pub save_pages_to_disk: bool,
    /// Where pages are persisted when enabled.
    pub output_directory: PathBuf,
    /// Sent on every request.
    pub user_agent: String,
    /// Honor robots.txt exclusions.
    pub respect_robots_txt: bool,
    /// Mark pages failing a structural HTML sanity check as failed.
    pub validate_html: bool,
    /// Requests-per-second cap on top of the politeness delay. Zero
    /// disables the limiter.
    pub max_requests_per_second: u32,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_pages: defaults::MAX_PAGES,
            max_depth: defaults::MAX_DEPTH,
            request_delay_ms: defaults::REQUEST_DELAY_MS,
            save_pages_to_disk: false,
            output_directory: PathBuf::from(defaults::OUTPUT_DIRECTORY),
            user_agent: defaults::USER_AGENT.to_string(),
            respect_robots_txt: true,
            validate_html: false,
            max_requests_per_second: defaults::MAX_REQUESTS_PER_SECOND,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub level: String,
    /// Also write logs to a rotating file.
    pub file_output: bool,
    /// Log directory; defaults to `logs/` next to the executable.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            file_output: false,
            log_dir: None,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub crawler: CrawlerConfig,
    pub logging: LoggingConfig,
}

/// Loads and saves the configuration file.
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Per-user configuration directory for this application.
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("sitefetch");
        Ok(config_dir)
    }

    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join("sitefetch.json");
        Ok(Self { config_path })
    }

    /// Manager reading and writing an explicit path. Used by tests and
    /// callers that keep configuration next to their data.
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// Load configuration, creating the default file on first run and
    /// resetting to defaults when the file no longer parses.
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;

        match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("Loaded configuration from: {:?}", self.config_path);
                Ok(config)
            }
            Err(parse_error) => {
                warn!("Configuration file unparseable ({parse_error}); resetting to defaults");
                let default_config = AppConfig::default();
                self.save_config(&default_config).await?;
                Ok(default_config)
            }
        }
    }

    /// Persist the configuration, creating the directory when missing.
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }
        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;
        Ok(())
    }
}
