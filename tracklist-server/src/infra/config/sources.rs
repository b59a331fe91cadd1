use serde::Deserialize;
use std::path::PathBuf;
use tracklist_core::cleanup::CleanupConfig;
use tracklist_core::scheduled::Frequency;

/// Raw configuration as written in a TOML file. Every value is optional;
/// absent values fall through to the defaults.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub cache: FileCacheConfig,
    #[serde(default)]
    pub memory_cache: FileMemoryCacheConfig,
    #[serde(default)]
    pub scheduler: FileSchedulerConfig,
    #[serde(default)]
    pub fetch: FileFetchConfig,
    #[serde(default)]
    pub rate_limit: FileRateLimitConfig,
    pub cleanup: Option<CleanupConfig>,
    #[serde(default)]
    pub scheduled: FileScheduledConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileDatabaseConfig {
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileCacheConfig {
    pub root: Option<PathBuf>,
    pub web_prefix: Option<String>,
    pub reports_dir: Option<PathBuf>,
    pub placeholder_url: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileMemoryCacheConfig {
    pub max_entries: Option<usize>,
    pub ttl: Option<String>,
    pub sweep_interval: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileSchedulerConfig {
    pub max_concurrent: Option<usize>,
    pub completed_history: Option<usize>,
    pub failed_history: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileFetchConfig {
    pub timeout: Option<String>,
    pub max_bytes: Option<usize>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileRateLimitConfig {
    pub hourly_max: Option<usize>,
    pub daily_max: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileScheduledConfig {
    #[serde(default)]
    pub cache_cleanup: FileCleanupTask,
    #[serde(default)]
    pub memory_cache_clear: FileTaskSchedule,
    #[serde(default)]
    pub reports: FileTaskSchedule,
    #[serde(default)]
    pub integrity_check: FileIntegrityTask,
    #[serde(default)]
    pub integrity_quick_check: FileTaskSchedule,
}

/// One `[scheduled.<task>]` table. `day` and `time` stay strings so a bad
/// value becomes a warning rather than a parse failure of the whole file.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileTaskSchedule {
    pub enabled: Option<bool>,
    pub schedule: Option<Frequency>,
    pub day: Option<String>,
    pub time: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileCleanupTask {
    #[serde(flatten)]
    pub schedule: FileTaskSchedule,
    pub retention_days: Option<u32>,
    pub max_size_mb: Option<u64>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileIntegrityTask {
    #[serde(flatten)]
    pub schedule: FileTaskSchedule,
    pub auto_repair: Option<bool>,
}

/// Schedule overrides read from the environment.
#[derive(Debug, Default, Clone)]
pub struct EnvSchedule {
    pub enabled: Option<bool>,
    pub day: Option<String>,
    pub time: Option<String>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub database_url: Option<String>,
    pub cache_root: Option<PathBuf>,
    pub cache_web_prefix: Option<String>,
    pub reports_dir: Option<PathBuf>,
    pub placeholder_url: Option<String>,
    pub memory_cache_max_entries: Option<usize>,
    pub memory_cache_ttl: Option<String>,
    pub scheduler_max_concurrent: Option<usize>,
    pub fetch_timeout: Option<String>,
    pub refresh_hourly_max: Option<usize>,
    pub refresh_daily_max: Option<usize>,
    pub cache_cleanup: EnvSchedule,
    pub cache_retention_days: Option<u32>,
    pub cache_max_size_mb: Option<u64>,
    pub cache_cleanup_dry_run: Option<bool>,
    pub memory_cache_clear: EnvSchedule,
    pub reports: EnvSchedule,
    pub integrity_check: EnvSchedule,
    pub integrity_auto_repair: Option<bool>,
    pub integrity_quick_check: Option<bool>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: std::env::var("TRACKLIST_CONFIG_PATH")
                .ok()
                .map(PathBuf::from),
            server_host: std::env::var("SERVER_HOST").ok(),
            server_port: parse_var("SERVER_PORT"),
            database_url: std::env::var("DATABASE_URL").ok(),
            cache_root: std::env::var("CACHE_DIR").ok().map(PathBuf::from),
            cache_web_prefix: std::env::var("CACHE_WEB_PREFIX").ok(),
            reports_dir: std::env::var("REPORTS_DIR").ok().map(PathBuf::from),
            placeholder_url: std::env::var("ARTWORK_PLACEHOLDER_URL").ok(),
            memory_cache_max_entries: parse_var("MEMORY_CACHE_MAX_ENTRIES"),
            memory_cache_ttl: std::env::var("MEMORY_CACHE_TTL").ok(),
            scheduler_max_concurrent: parse_var("SCHEDULER_MAX_CONCURRENT"),
            fetch_timeout: std::env::var("FETCH_TIMEOUT").ok(),
            refresh_hourly_max: parse_var("REFRESH_HOURLY_MAX"),
            refresh_daily_max: parse_var("REFRESH_DAILY_MAX"),
            cache_cleanup: EnvSchedule {
                enabled: parse_bool_var("CACHE_CLEANUP_ENABLED"),
                day: None,
                time: std::env::var("CACHE_CLEANUP_TIME").ok(),
            },
            cache_retention_days: parse_var("CACHE_RETENTION_DAYS"),
            cache_max_size_mb: parse_var("CACHE_MAX_SIZE_MB"),
            cache_cleanup_dry_run: parse_bool_var("CACHE_CLEANUP_DRY_RUN"),
            memory_cache_clear: env_schedule("MEMORY_CACHE_CLEAR"),
            reports: env_schedule("REPORTS"),
            integrity_check: env_schedule("INTEGRITY_CHECK"),
            integrity_auto_repair: parse_bool_var("INTEGRITY_AUTO_REPAIR"),
            integrity_quick_check: parse_bool_var("INTEGRITY_QUICK_CHECK"),
        }
    }
}

fn env_schedule(prefix: &str) -> EnvSchedule {
    EnvSchedule {
        enabled: parse_bool_var(&format!("{prefix}_ENABLED")),
        day: std::env::var(format!("{prefix}_DAY")).ok(),
        time: std::env::var(format!("{prefix}_TIME")).ok(),
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

pub fn parse_bool_var(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|raw| parse_bool(&raw))
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" on "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn scheduled_tables_flatten_task_fields() {
        let raw = r#"
            [scheduled.cache_cleanup]
            enabled = false
            time = "04:30"
            retention_days = 90

            [scheduled.integrity_check]
            schedule = "weekly"
            day = "saturday"
            auto_repair = false

            [cleanup]
            batch_size = 25
        "#;
        let file: FileConfig = toml::from_str(raw).unwrap();
        let cleanup = &file.scheduled.cache_cleanup;
        assert_eq!(cleanup.schedule.enabled, Some(false));
        assert_eq!(cleanup.schedule.time.as_deref(), Some("04:30"));
        assert_eq!(cleanup.retention_days, Some(90));

        let integrity = &file.scheduled.integrity_check;
        assert_eq!(integrity.schedule.schedule, Some(Frequency::Weekly));
        assert_eq!(integrity.auto_repair, Some(false));

        let cleanup_defaults = file.cleanup.unwrap();
        assert_eq!(cleanup_defaults.batch_size, 25);
        assert_eq!(cleanup_defaults.default_retention_days, 365);
    }
}
