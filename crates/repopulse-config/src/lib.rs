use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const REPOPULSE_DIR_NAME: &str = ".repopulse";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_DATABASE_FILE: &str = "repopulse.sqlite";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const DEFAULT_GITHUB_API_VERSION: &str = "2022-11-28";
pub const DEFAULT_SERVER_BIND: &str = "127.0.0.1:8080";

const DEFAULT_PER_PAGE: u32 = 100;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REVIEW_SCAN_LIMIT: u32 = 100;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 24 * 60 * 60;
const MIN_SYNC_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RepoPulseConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Relative paths resolve against the `.repopulse` directory.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound on pull requests inspected when counting reviews.
    #[serde(default = "default_review_scan_limit")]
    pub review_scan_limit: u32,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
            api_version: default_api_version(),
            per_page: default_per_page(),
            timeout_secs: default_timeout_secs(),
            review_scan_limit: default_review_scan_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_true")]
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Run the sync cycle in the background while serving.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_sync_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn repopulse_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(REPOPULSE_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    repopulse_dir(workspace_root).join(CONFIG_FILE_NAME)
}

/// Absolute path of the SQLite database configured for `workspace_root`.
pub fn database_path(workspace_root: impl AsRef<Path>, config: &RepoPulseConfig) -> PathBuf {
    let configured = Path::new(&config.storage.database);
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        repopulse_dir(workspace_root).join(configured)
    }
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<RepoPulseConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(RepoPulseConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: RepoPulseConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<RepoPulseConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(repopulse_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = RepoPulseConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

pub fn validate_config(config: &RepoPulseConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if !config.github.api_url.starts_with("http://") && !config.github.api_url.starts_with("https://")
    {
        warnings.push(ConfigWarning {
            code: "github_api_url",
            message: format!(
                "github.api_url '{}' is not an http(s) URL",
                config.github.api_url
            ),
        });
    }

    if config.github.per_page == 0 || config.github.per_page > 100 {
        warnings.push(ConfigWarning {
            code: "github_per_page",
            message: format!(
                "github.per_page {} is outside 1..=100, it will be clamped",
                config.github.per_page
            ),
        });
    }

    if config.sync.enabled && config.sync.interval_secs < MIN_SYNC_INTERVAL_SECS {
        warnings.push(ConfigWarning {
            code: "sync_interval",
            message: format!(
                "sync.interval_secs {} is below {MIN_SYNC_INTERVAL_SECS}, it will be raised",
                config.sync.interval_secs
            ),
        });
    }

    if config.server.bind.parse::<std::net::SocketAddr>().is_err() {
        warnings.push(ConfigWarning {
            code: "server_bind",
            message: format!("server.bind '{}' is not a socket address", config.server.bind),
        });
    }

    warnings
}

impl SyncConfig {
    pub fn effective_interval_secs(&self) -> u64 {
        self.interval_secs.max(MIN_SYNC_INTERVAL_SECS)
    }
}

impl GithubConfig {
    pub fn effective_per_page(&self) -> u32 {
        self.per_page.clamp(1, 100)
    }
}

fn default_database() -> String {
    DEFAULT_DATABASE_FILE.to_owned()
}

fn default_api_url() -> String {
    DEFAULT_GITHUB_API_URL.to_owned()
}

fn default_token_env() -> String {
    DEFAULT_GITHUB_TOKEN_ENV.to_owned()
}

fn default_api_version() -> String {
    DEFAULT_GITHUB_API_VERSION.to_owned()
}

fn default_per_page() -> u32 {
    DEFAULT_PER_PAGE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_review_scan_limit() -> u32 {
    DEFAULT_REVIEW_SCAN_LIMIT
}

fn default_bind() -> String {
    DEFAULT_SERVER_BIND.to_owned()
}

fn default_sync_interval_secs() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

fn normalize_required(value: &str, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_owned()
    }
}

fn normalize_config(mut config: RepoPulseConfig) -> RepoPulseConfig {
    config.storage.database = normalize_required(&config.storage.database, default_database);
    config.github.api_url =
        normalize_required(&config.github.api_url, default_api_url)
            .trim_end_matches('/')
            .to_owned();
    config.github.token_env = normalize_required(&config.github.token_env, default_token_env);
    config.github.api_version =
        normalize_required(&config.github.api_version, default_api_version);
    config.server.bind = normalize_required(&config.server.bind, default_bind);

    config
}
