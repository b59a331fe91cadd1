use chrono::{NaiveTime, Weekday};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracklist_core::scheduled::TaskSchedule;

use super::{
    Config, ConfigMetadata, ConfigWarnings, parse_duration,
    sources::{EnvConfig, EnvSchedule, FileConfig, FileTaskSchedule},
};

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["tracklist.toml", "config/tracklist.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Skip `.env` and process environment; used by tests.
    pub ignore_env: bool,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let (env, env_file_loaded) = if self.options.ignore_env {
            (EnvConfig::default(), false)
        } else {
            let loaded = self.load_env_file()?;
            (EnvConfig::gather(), loaded)
        };

        let (file, config_path) = self.load_file_config(&env)?;
        let mut warnings = ConfigWarnings::default();
        if config_path.is_none() {
            warnings.push_with_hint(
                "No tracklist.toml detected; using defaults and environment variables",
                "Pass --config or set TRACKLIST_CONFIG_PATH to use a configuration file",
            );
        }

        let mut config = Config::default();
        apply_file(&mut config, file.unwrap_or_default(), &mut warnings);
        apply_env(&mut config, env, &mut warnings);
        config.metadata = ConfigMetadata {
            config_path,
            env_file_loaded,
        };

        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        let result = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        match result {
            Ok(loaded) => Ok(loaded),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(err) => Err(ConfigLoadError::EnvFile(err)),
        }
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        // Explicit and env-provided paths must exist; defaults are optional.
        let (path, required) = match (&self.options.config_path, &env.config_path) {
            (Some(path), _) | (None, Some(path)) => (path.clone(), true),
            (None, None) => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => (path, false),
                None => return Ok((None, None)),
            },
        };

        if !path.exists() {
            if required {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let file = read_file_config(&path)?;
        Ok((Some(file), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_file(config: &mut Config, file: FileConfig, warnings: &mut ConfigWarnings) {
    let FileConfig {
        server,
        database,
        cache,
        memory_cache,
        scheduler,
        fetch,
        rate_limit,
        cleanup,
        scheduled,
    } = file;

    if let Some(host) = server.host {
        config.server.host = host;
    }
    if let Some(port) = server.port {
        config.server.port = port;
    }

    if database.url.is_some() {
        config.database.url = database.url;
    }
    if let Some(max) = database.max_connections {
        config.database.max_connections = max;
    }

    if let Some(root) = cache.root {
        config.cache.root = root;
    }
    if let Some(prefix) = cache.web_prefix {
        config.cache.web_prefix = prefix;
    }
    if let Some(dir) = cache.reports_dir {
        config.cache.reports_dir = dir;
    }
    if let Some(url) = cache.placeholder_url {
        config.cache.placeholder_url = url;
    }

    if let Some(max) = memory_cache.max_entries {
        config.memory_cache.max_entries = max;
    }
    set_duration(
        &mut config.memory_cache.ttl,
        memory_cache.ttl.as_deref(),
        "memory_cache.ttl",
        warnings,
    );
    set_duration(
        &mut config.memory_cache.sweep_interval,
        memory_cache.sweep_interval.as_deref(),
        "memory_cache.sweep_interval",
        warnings,
    );

    if let Some(max) = scheduler.max_concurrent {
        config.scheduler.max_concurrent = max;
    }
    if let Some(len) = scheduler.completed_history {
        config.scheduler.completed_history = len;
    }
    if let Some(len) = scheduler.failed_history {
        config.scheduler.failed_history = len;
    }

    set_duration(
        &mut config.fetch.timeout,
        fetch.timeout.as_deref(),
        "fetch.timeout",
        warnings,
    );
    if let Some(max) = fetch.max_bytes {
        config.fetch.max_bytes = max;
    }
    if let Some(agent) = fetch.user_agent {
        config.fetch.user_agent = agent;
    }

    if let Some(max) = rate_limit.hourly_max {
        config.rate_limit.hourly_max = max;
    }
    if let Some(max) = rate_limit.daily_max {
        config.rate_limit.daily_max = max;
    }

    if let Some(cleanup) = cleanup {
        config.cleanup = cleanup;
    }

    let tasks = &mut config.scheduled;
    apply_file_schedule(
        &mut tasks.cache_cleanup,
        &scheduled.cache_cleanup.schedule,
        "cache_cleanup",
        warnings,
    );
    if let Some(days) = scheduled.cache_cleanup.retention_days {
        tasks.cleanup_retention_days = days;
    }
    if scheduled.cache_cleanup.max_size_mb.is_some() {
        tasks.cleanup_max_size_mb = scheduled.cache_cleanup.max_size_mb;
    }
    if let Some(dry_run) = scheduled.cache_cleanup.dry_run {
        tasks.cleanup_dry_run = dry_run;
    }
    apply_file_schedule(
        &mut tasks.memory_cache_clear,
        &scheduled.memory_cache_clear,
        "memory_cache_clear",
        warnings,
    );
    apply_file_schedule(&mut tasks.reports, &scheduled.reports, "reports", warnings);
    apply_file_schedule(
        &mut tasks.integrity_check,
        &scheduled.integrity_check.schedule,
        "integrity_check",
        warnings,
    );
    if let Some(repair) = scheduled.integrity_check.auto_repair {
        tasks.integrity_auto_repair = repair;
    }
    apply_file_schedule(
        &mut tasks.integrity_quick_check,
        &scheduled.integrity_quick_check,
        "integrity_quick_check",
        warnings,
    );
}

fn apply_env(config: &mut Config, env: EnvConfig, warnings: &mut ConfigWarnings) {
    if let Some(host) = env.server_host {
        config.server.host = host;
    }
    if let Some(port) = env.server_port {
        config.server.port = port;
    }
    if env.database_url.is_some() {
        config.database.url = env.database_url;
    }
    if let Some(root) = env.cache_root {
        config.cache.root = root;
    }
    if let Some(prefix) = env.cache_web_prefix {
        config.cache.web_prefix = prefix;
    }
    if let Some(dir) = env.reports_dir {
        config.cache.reports_dir = dir;
    }
    if let Some(url) = env.placeholder_url {
        config.cache.placeholder_url = url;
    }
    if let Some(max) = env.memory_cache_max_entries {
        config.memory_cache.max_entries = max;
    }
    set_duration(
        &mut config.memory_cache.ttl,
        env.memory_cache_ttl.as_deref(),
        "MEMORY_CACHE_TTL",
        warnings,
    );
    if let Some(max) = env.scheduler_max_concurrent {
        config.scheduler.max_concurrent = max;
    }
    set_duration(
        &mut config.fetch.timeout,
        env.fetch_timeout.as_deref(),
        "FETCH_TIMEOUT",
        warnings,
    );
    if let Some(max) = env.refresh_hourly_max {
        config.rate_limit.hourly_max = max;
    }
    if let Some(max) = env.refresh_daily_max {
        config.rate_limit.daily_max = max;
    }

    let tasks = &mut config.scheduled;
    apply_env_schedule(
        &mut tasks.cache_cleanup,
        &env.cache_cleanup,
        "CACHE_CLEANUP",
        warnings,
    );
    if let Some(days) = env.cache_retention_days {
        tasks.cleanup_retention_days = days;
    }
    if env.cache_max_size_mb.is_some() {
        tasks.cleanup_max_size_mb = env.cache_max_size_mb;
    }
    if let Some(dry_run) = env.cache_cleanup_dry_run {
        tasks.cleanup_dry_run = dry_run;
    }
    apply_env_schedule(
        &mut tasks.memory_cache_clear,
        &env.memory_cache_clear,
        "MEMORY_CACHE_CLEAR",
        warnings,
    );
    apply_env_schedule(&mut tasks.reports, &env.reports, "REPORTS", warnings);
    apply_env_schedule(
        &mut tasks.integrity_check,
        &env.integrity_check,
        "INTEGRITY_CHECK",
        warnings,
    );
    if let Some(repair) = env.integrity_auto_repair {
        tasks.integrity_auto_repair = repair;
    }
    if let Some(enabled) = env.integrity_quick_check {
        tasks.integrity_quick_check.enabled = enabled;
    }
}

fn apply_file_schedule(
    schedule: &mut TaskSchedule,
    file: &FileTaskSchedule,
    name: &str,
    warnings: &mut ConfigWarnings,
) {
    if let Some(enabled) = file.enabled {
        schedule.enabled = enabled;
    }
    if let Some(frequency) = file.schedule {
        schedule.frequency = frequency;
    }
    set_day(schedule, file.day.as_deref(), name, warnings);
    set_time(schedule, file.time.as_deref(), name, warnings);
}

fn apply_env_schedule(
    schedule: &mut TaskSchedule,
    env: &EnvSchedule,
    prefix: &str,
    warnings: &mut ConfigWarnings,
) {
    if let Some(enabled) = env.enabled {
        schedule.enabled = enabled;
    }
    set_day(schedule, env.day.as_deref(), &format!("{prefix}_DAY"), warnings);
    set_time(schedule, env.time.as_deref(), &format!("{prefix}_TIME"), warnings);
}

fn set_day(
    schedule: &mut TaskSchedule,
    raw: Option<&str>,
    source: &str,
    warnings: &mut ConfigWarnings,
) {
    let Some(raw) = raw else {
        return;
    };
    match raw.trim().parse::<Weekday>() {
        Ok(day) => schedule.day = day,
        Err(_) => warnings.push_with_hint(
            format!("Unknown weekday {raw:?} for {source}; keeping {}", schedule.day),
            "Use a day name such as monday or sun",
        ),
    }
}

fn set_time(
    schedule: &mut TaskSchedule,
    raw: Option<&str>,
    source: &str,
    warnings: &mut ConfigWarnings,
) {
    let Some(raw) = raw else {
        return;
    };
    match NaiveTime::parse_from_str(raw.trim(), "%H:%M") {
        Ok(time) => schedule.time = time,
        Err(_) => warnings.push_with_hint(
            format!(
                "Unparsable time {raw:?} for {source}; keeping {}",
                schedule.time.format("%H:%M")
            ),
            "Times use 24-hour HH:MM",
        ),
    }
}

fn set_duration(
    target: &mut std::time::Duration,
    raw: Option<&str>,
    source: &str,
    warnings: &mut ConfigWarnings,
) {
    let Some(raw) = raw else {
        return;
    };
    match parse_duration(raw) {
        Some(duration) => *target = duration,
        None => warnings.push_with_hint(
            format!("Unparsable duration {raw:?} for {source}"),
            "Use a humantime duration such as 30s, 5m or 1h",
        ),
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to load .env file")]
    EnvFile(#[source] dotenvy::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tracklist_core::scheduled::Frequency;

    fn isolated(path: Option<PathBuf>) -> ConfigLoader {
        ConfigLoader::with_options(ConfigLoaderOptions {
            config_path: path,
            env_file: None,
            ignore_env: true,
        })
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = isolated(Some(dir.path().join("nope.toml")))
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tracklist.toml");
        fs::write(
            &path,
            r#"
                [server]
                port = 9100

                [memory_cache]
                max_entries = 50
                ttl = "10m"

                [fetch]
                timeout = "5s"

                [scheduled.reports]
                enabled = false
                schedule = "daily"
                time = "22:15"
            "#,
        )
        .unwrap();

        let ConfigLoad { config, warnings } = isolated(Some(path.clone())).load().unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.memory_cache.max_entries, 50);
        assert_eq!(config.memory_cache.ttl, Duration::from_secs(600));
        assert_eq!(config.fetch.timeout, Duration::from_secs(5));
        assert!(!config.scheduled.reports.enabled);
        assert_eq!(config.scheduled.reports.frequency, Frequency::Daily);
        assert_eq!(
            config.scheduled.reports.time,
            NaiveTime::from_hms_opt(22, 15, 0).unwrap()
        );
        assert_eq!(config.metadata.config_path, Some(path));
    }

    #[test]
    fn bad_schedule_values_become_warnings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tracklist.toml");
        fs::write(
            &path,
            r#"
                [scheduled.integrity_check]
                day = "someday"
                time = "25:99"

                [memory_cache]
                ttl = "forever"
            "#,
        )
        .unwrap();

        let ConfigLoad { config, warnings } = isolated(Some(path)).load().unwrap();
        assert_eq!(warnings.len(), 3);
        assert_eq!(config.scheduled.integrity_check.day, Weekday::Sun);
        assert_eq!(
            config.scheduled.integrity_check.time,
            NaiveTime::from_hms_opt(2, 0, 0).unwrap()
        );
        assert_eq!(config.memory_cache.ttl, Duration::from_secs(3600));
    }

    #[test]
    fn env_overrides_file_schedule() {
        let mut config = Config::default();
        let env = EnvConfig {
            cache_cleanup: EnvSchedule {
                enabled: Some(false),
                day: None,
                time: Some("05:45".to_string()),
            },
            cache_retention_days: Some(120),
            integrity_quick_check: Some(false),
            memory_cache_clear: EnvSchedule {
                enabled: None,
                day: Some("wed".to_string()),
                time: None,
            },
            ..EnvConfig::default()
        };
        let mut warnings = ConfigWarnings::default();
        apply_env(&mut config, env, &mut warnings);

        assert!(warnings.is_empty());
        let tasks = &config.scheduled;
        assert!(!tasks.cache_cleanup.enabled);
        assert_eq!(tasks.cache_cleanup.time, NaiveTime::from_hms_opt(5, 45, 0).unwrap());
        assert_eq!(tasks.cleanup_retention_days, 120);
        assert!(!tasks.integrity_quick_check.enabled);
        assert_eq!(tasks.memory_cache_clear.day, Weekday::Wed);
    }
}
