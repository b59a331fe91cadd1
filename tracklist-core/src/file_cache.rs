//! On-disk artwork layout.
//!
//! One subdirectory per size variant under the cache root; each file is named
//! by the cache key of its origin URL plus an extension.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::artwork::SizeVariant;
use crate::error::Result;

/// Hex characters kept from the URL digest.
const CACHE_KEY_LEN: usize = 32;
const DEFAULT_EXTENSION: &str = "jpg";

/// A file found under the cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    /// Absolute path.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// Disk usage of one variant directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VariantUsage {
    /// File count.
    pub files: usize,
    /// Total bytes.
    pub bytes: u64,
}

/// Disk usage across the cache root.
#[derive(Debug, Clone, Serialize)]
pub struct CacheFsStatistics {
    /// Cache root.
    pub root: PathBuf,
    /// Usage per variant directory, keyed by variant name.
    pub variants: BTreeMap<String, VariantUsage>,
    /// Files across all variants.
    pub total_files: usize,
    /// Bytes across all variants.
    pub total_bytes: u64,
    /// `total_bytes` in megabytes.
    pub total_mb: f64,
}

/// Result of checking that the cache directories exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructureReport {
    /// Whether the root is a directory.
    pub root_exists: bool,
    /// Variant directories that are absent.
    pub missing_dirs: Vec<String>,
}

impl StructureReport {
    /// True when nothing is missing.
    pub fn is_valid(&self) -> bool {
        self.root_exists && self.missing_dirs.is_empty()
    }
}

/// Where variant files live on disk and how they map to web paths.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
    web_prefix: String,
}

impl CacheLayout {
    /// Relative roots are resolved against the current directory.
    pub fn new(root: impl Into<PathBuf>, web_prefix: impl Into<String>) -> Self {
        let root = root.into();
        // Stored file paths must stay valid regardless of the working dir
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(root)
        };

        Self {
            root,
            web_prefix: web_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Absolute cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic key for an origin URL: truncated SHA-256 hex digest.
    pub fn generate_cache_key(url: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        let mut key = format!("{digest:x}");
        key.truncate(CACHE_KEY_LEN);
        key
    }

    /// Directory holding one variant's files.
    pub fn variant_dir(&self, variant: SizeVariant) -> PathBuf {
        self.root.join(variant.as_str())
    }

    /// Path for a cache key and variant name. `ext` may carry a leading dot
    /// and defaults to `jpg`; unknown variants are rejected.
    pub fn get_cache_path(
        &self,
        cache_key: &str,
        variant: &str,
        ext: Option<&str>,
    ) -> Result<PathBuf> {
        let variant = variant.parse::<SizeVariant>()?;
        Ok(self.path_for(cache_key, variant, ext))
    }

    /// Like [`CacheLayout::get_cache_path`] with an already parsed variant.
    pub fn path_for(
        &self,
        cache_key: &str,
        variant: SizeVariant,
        ext: Option<&str>,
    ) -> PathBuf {
        let ext = ext
            .map(|ext| ext.trim_start_matches('.'))
            .filter(|ext| !ext.is_empty())
            .unwrap_or(DEFAULT_EXTENSION);
        self.variant_dir(variant).join(format!("{cache_key}.{ext}"))
    }

    /// Servable URL for a file under the cache root.
    pub fn web_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(format!("{}/{}", self.web_prefix, parts.join("/")))
    }

    /// Whether a path is one of the variant subdirectories' direct children.
    pub fn is_variant_file(&self, path: &Path) -> bool {
        path.parent()
            .and_then(|parent| parent.strip_prefix(&self.root).ok())
            .and_then(|dir| dir.to_str())
            .and_then(SizeVariant::parse)
            .is_some()
    }

    /// Creates the root and every variant directory.
    pub async fn ensure_structure(&self) -> Result<()> {
        for variant in SizeVariant::ALL {
            fs::create_dir_all(self.variant_dir(variant)).await?;
        }
        debug!(root = %self.root.display(), "artwork cache structure ready");
        Ok(())
    }

    /// Reports missing directories without creating them.
    pub async fn verify_structure(&self) -> StructureReport {
        let root_exists = fs::metadata(&self.root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);

        let mut missing_dirs = Vec::new();
        for variant in SizeVariant::ALL {
            let present = fs::metadata(self.variant_dir(variant))
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false);
            if !present {
                missing_dirs.push(variant.as_str().to_string());
            }
        }

        StructureReport {
            root_exists,
            missing_dirs,
        }
    }

    /// Every regular file under the root, recursively.
    pub async fn list_files(&self) -> Result<Vec<CachedFile>> {
        let mut files = Vec::new();
        if fs::metadata(&self.root).await.is_err() {
            return Ok(files);
        }
        collect_files(&self.root, &mut files).await?;
        Ok(files)
    }

    /// Walks the variant directories and totals their usage.
    pub async fn statistics(&self) -> Result<CacheFsStatistics> {
        let mut variants: BTreeMap<String, VariantUsage> = SizeVariant::ALL
            .iter()
            .map(|variant| (variant.as_str().to_string(), VariantUsage::default()))
            .collect();

        let files = self.list_files().await?;
        let mut total_bytes = 0u64;
        for file in &files {
            total_bytes += file.size;
            let bucket = file
                .path
                .parent()
                .and_then(|parent| parent.strip_prefix(&self.root).ok())
                .and_then(|dir| dir.to_str())
                .and_then(SizeVariant::parse)
                .map(|variant| variant.as_str().to_string())
                .unwrap_or_else(|| "other".to_string());
            let usage = variants.entry(bucket).or_default();
            usage.files += 1;
            usage.bytes += file.size;
        }

        Ok(CacheFsStatistics {
            root: self.root.clone(),
            variants,
            total_files: files.len(),
            total_bytes,
            total_mb: total_bytes as f64 / 1_048_576.0,
        })
    }

    /// Removes every variant file stored under `cache_key`.
    pub async fn delete_key(&self, cache_key: &str) -> Result<usize> {
        let prefix = format!("{cache_key}.");
        let mut deleted = 0;

        for variant in SizeVariant::ALL {
            let dir = self.variant_dir(variant);
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                let matches = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(&prefix));
                if matches && remove_file_if_exists(&entry.path()).await? {
                    deleted += 1;
                }
            }
        }

        if deleted > 0 {
            info!(cache_key, deleted, "deleted cached artwork files");
        }
        Ok(deleted)
    }
}

/// Removes a file, treating an already-missing file as success.
/// Returns whether a file was actually removed.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Writes `<path>.part` then renames it over `path`, so readers never see a
/// truncated file.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let partial = path.with_extension("part");
    fs::write(&partial, bytes).await?;
    if let Err(e) = fs::rename(&partial, path).await {
        let _ = remove_file_if_exists(&partial).await;
        return Err(e.into());
    }
    Ok(())
}

/// True for an existing regular file; any error counts as absent.
pub async fn file_exists(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

fn collect_files<'a>(
    dir: &'a Path,
    files: &'a mut Vec<CachedFile>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let mut entries = fs::read_dir(dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };

            if metadata.is_file() {
                let modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                files.push(CachedFile {
                    path,
                    size: metadata.len(),
                    modified,
                });
            } else if metadata.is_dir() {
                collect_files(&path, files).await?;
            }
        }

        Ok(())
    })
}
