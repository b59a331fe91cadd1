//! Server configuration: built-in defaults, an optional TOML file and
//! environment overrides, resolved by [`ConfigLoader`].

pub mod loader;
pub mod sources;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracklist_core::cleanup::CleanupConfig;
use tracklist_core::fetch::FetchSettings;
use tracklist_core::memory_cache::MemoryCacheConfig;
use tracklist_core::resolver::DEFAULT_PLACEHOLDER;
use tracklist_core::scheduled::ScheduledTasksConfig;
use tracklist_core::scheduler::SchedulerConfig;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub memory_cache: MemoryCacheConfig,
    pub scheduler: SchedulerConfig,
    pub fetch: FetchSettings,
    pub rate_limit: RateLimitConfig,
    pub cleanup: CleanupConfig,
    pub scheduled: ScheduledTasksConfig,
    pub metadata: ConfigMetadata,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            memory_cache: MemoryCacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            fetch: FetchSettings::default(),
            rate_limit: RateLimitConfig::default(),
            cleanup: CleanupConfig::default(),
            scheduled: ScheduledTasksConfig::default(),
            metadata: ConfigMetadata::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Without a URL the server runs against the in-memory stores.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub web_prefix: String,
    pub reports_dir: PathBuf,
    pub placeholder_url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("static/artwork_cache"),
            web_prefix: "/static/artwork_cache".to_string(),
            reports_dir: PathBuf::from("logs"),
            placeholder_url: DEFAULT_PLACEHOLDER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitConfig {
    pub hourly_max: usize,
    pub daily_max: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            hourly_max: 5,
            daily_max: 20,
        }
    }
}

/// Where the resolved values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

/// A non-fatal problem found while loading; the offending value keeps its
/// previous setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(&mut self, message: impl Into<String>, hint: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Parses a humantime duration such as `90s`, `5m` or `1h 30m`.
pub(crate) fn parse_duration(raw: &str) -> Option<Duration> {
    humantime::parse_duration(raw.trim()).ok()
}
