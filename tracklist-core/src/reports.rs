//! Timestamped JSON report artifacts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::Result;

/// Subdirectory for cleanup run reports.
pub const CLEANUP_REPORTS: &str = "cleanup_reports";
/// Subdirectory for scheduled task reports.
pub const SCHEDULED_REPORTS: &str = "scheduled_tasks";
const MAX_SUFFIX: u32 = 1000;

/// Writes JSON reports under a base directory.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    /// Reports land under `dir`, which is created on demand.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Base directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `{subdir}/{prefix}_{YYYYmmdd_HHMMSS}.json` and returns its path.
    /// Runs landing in the same second get a `_1`, `_2`, ... suffix instead of
    /// overwriting each other.
    pub async fn write<T: Serialize>(
        &self,
        subdir: Option<&str>,
        prefix: &str,
        at: DateTime<Utc>,
        report: &T,
    ) -> Result<PathBuf> {
        let dir = match subdir {
            Some(subdir) => self.dir.join(subdir),
            None => self.dir.clone(),
        };
        fs::create_dir_all(&dir).await?;

        let stem = format!("{prefix}_{}", at.format("%Y%m%d_%H%M%S"));
        let body = serde_json::to_vec_pretty(report)?;

        let mut attempt = 0u32;
        loop {
            let path = match attempt {
                0 => dir.join(format!("{stem}.json")),
                n => dir.join(format!("{stem}_{n}.json")),
            };
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(&body).await?;
                    file.flush().await?;
                    info!(path = %path.display(), "report saved");
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < MAX_SUFFIX => {
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
