//! Index/filesystem consistency verification and repair.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artwork::{CacheEntry, EntityId, SizeVariant};
use crate::clock::SharedClock;
use crate::database::ports::albums::AlbumStore;
use crate::database::ports::cache_entries::CacheEntryRepository;
use crate::error::{ArtworkError, Result};
use crate::fetch::processor;
use crate::file_cache::{CacheLayout, file_exists, remove_file_if_exists, write_atomically};
use crate::reports::ReportWriter;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const DECODE_SAMPLE: usize = 100;
const QUICK_SAMPLE: usize = 50;
const DETAIL_LIMIT: usize = 10;
const DEFAULT_GRACE_DAYS: u32 = 7;

/// Index row whose file is gone.
#[derive(Debug, Clone, Serialize)]
pub struct MissingFile {
    /// Cache index row.
    pub record_id: Uuid,
    /// Album the row belongs to.
    pub entity_id: EntityId,
    /// Variant the file was rendered for.
    pub size_variant: SizeVariant,
    /// Path the row points at.
    pub file_path: PathBuf,
}

/// File whose size disagrees with the index.
#[derive(Debug, Clone, Serialize)]
pub struct SizeMismatch {
    /// Cache index row.
    pub record_id: Uuid,
    /// Album the row belongs to.
    pub entity_id: EntityId,
    /// Size recorded in the index.
    pub expected_size: u64,
    /// Size on disk.
    pub actual_size: u64,
    /// Offending file.
    pub file_path: PathBuf,
}

/// Image under the cache root that no index row references.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanedFile {
    /// Unreferenced file.
    pub file_path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// File that exists but does not decode.
#[derive(Debug, Clone, Serialize)]
pub struct CorruptedFile {
    /// Cache index row.
    pub record_id: Uuid,
    /// Album the row belongs to.
    pub entity_id: EntityId,
    /// Undecodable file.
    pub file_path: PathBuf,
    /// Decoder error.
    pub error: String,
}

/// Album with some variants cached but not all.
#[derive(Debug, Clone, Serialize)]
pub struct MissingVariants {
    /// Affected album.
    pub entity_id: EntityId,
    /// Variants with no row.
    pub missing: Vec<SizeVariant>,
    /// Whether the original is on disk.
    pub has_original: bool,
    /// Whether the missing variants can be rendered from the original.
    pub can_rebuild: bool,
}

/// One repair action and how it went.
#[derive(Debug, Clone, Serialize)]
pub struct Repair {
    /// Action taken, e.g. `remove_record` or `rebuild_variant`.
    pub kind: &'static str,
    /// Row id, file path or album the action applied to.
    pub target: String,
    /// Failure reason, for failed repairs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Headline numbers of a full check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegritySummary {
    /// Rows examined.
    pub total_records: usize,
    /// Rows whose file checked out.
    pub valid_files: usize,
    /// Sum of all issue counts.
    pub issues_found: usize,
    /// Successful repairs.
    pub repairs_completed: usize,
    /// Failed repairs.
    pub repairs_failed: usize,
}

/// Issue totals by category.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IssueCounts {
    /// Rows without a file.
    pub missing_files: usize,
    /// Files that fail to decode.
    pub corrupted_files: usize,
    /// Files without a row.
    pub orphaned_files: usize,
    /// Files whose size drifted.
    pub size_mismatches: usize,
    /// Albums with incomplete variant sets.
    pub missing_variants: usize,
}

/// First few issues of each category plus every repair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IssueDetails {
    /// Sample of missing files.
    pub missing_files: Vec<MissingFile>,
    /// Sample of corrupted files.
    pub corrupted_files: Vec<CorruptedFile>,
    /// Sample of orphaned files.
    pub orphaned_files: Vec<OrphanedFile>,
    /// Sample of size mismatches.
    pub size_mismatches: Vec<SizeMismatch>,
    /// Sample of incomplete albums.
    pub missing_variants: Vec<MissingVariants>,
    /// Repairs that succeeded.
    pub repaired: Vec<Repair>,
    /// Repairs that failed.
    pub failed_repairs: Vec<Repair>,
}

/// Outcome of a full integrity check.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Wall time in seconds.
    pub duration_seconds: f64,
    /// Percentage of rows with a valid file; 100 for an empty index.
    pub integrity_score: f64,
    /// Whether repairs were attempted.
    pub repair: bool,
    /// Headline numbers.
    pub summary: IntegritySummary,
    /// Totals by category.
    pub issues: IssueCounts,
    /// Samples and repairs.
    pub details: IssueDetails,
    /// Non-fatal errors encountered.
    pub errors: Vec<String>,
    /// Where the JSON report was written, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

/// Sampled existence check used by the health and status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct QuickCheckReport {
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Rows sampled.
    pub sample_size: usize,
    /// Rows in the index.
    pub total_records: u64,
    /// Sampled rows whose file exists.
    pub sample_valid: usize,
    /// Sampled rows whose file is gone.
    pub sample_missing: usize,
    /// Missing rows extrapolated to the whole index.
    pub estimated_missing: u64,
    /// Sample validity as a percentage.
    pub estimated_integrity_score: f64,
}

#[derive(Default)]
struct Findings {
    total_records: usize,
    valid_files: usize,
    missing_files: Vec<MissingFile>,
    size_mismatches: Vec<SizeMismatch>,
    orphaned_files: Vec<OrphanedFile>,
    corrupted_files: Vec<CorruptedFile>,
    missing_variants: Vec<MissingVariants>,
    repaired: Vec<Repair>,
    failed_repairs: Vec<Repair>,
    errors: Vec<String>,
}

impl Findings {
    fn issue_count(&self) -> usize {
        self.missing_files.len()
            + self.corrupted_files.len()
            + self.orphaned_files.len()
            + self.size_mismatches.len()
            + self.missing_variants.len()
    }

    fn step_failed(&mut self, step: &str, error: ArtworkError) {
        error!(step, "integrity check step failed: {error}");
        self.errors.push(format!("{step}: {error}"));
    }

    fn record_repair(&mut self, kind: &'static str, target: impl Into<String>) {
        self.repaired.push(Repair {
            kind,
            target: target.into(),
            error: None,
        });
    }

    fn repair_failed(&mut self, kind: &'static str, target: impl Into<String>, error: impl ToString) {
        let target = target.into();
        warn!(kind, target = %target, "integrity repair failed");
        self.failed_repairs.push(Repair {
            kind,
            target,
            error: Some(error.to_string()),
        });
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn first<T: Clone>(items: &[T]) -> Vec<T> {
    items.iter().take(DETAIL_LIMIT).cloned().collect()
}

/// Verifies the cache index against the files on disk and optionally repairs drift.
pub struct IntegrityChecker {
    entries: Arc<dyn CacheEntryRepository>,
    albums: Arc<dyn AlbumStore>,
    layout: Arc<CacheLayout>,
    reports: ReportWriter,
    clock: SharedClock,
    grace_days: u32,
}

impl std::fmt::Debug for IntegrityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityChecker")
            .field("root", &self.layout.root())
            .finish_non_exhaustive()
    }
}

impl IntegrityChecker {
    /// Starts with a seven day grace period for unreferenced files.
    pub fn new(
        entries: Arc<dyn CacheEntryRepository>,
        albums: Arc<dyn AlbumStore>,
        layout: Arc<CacheLayout>,
        reports: ReportWriter,
        clock: SharedClock,
    ) -> Self {
        Self {
            entries,
            albums,
            layout,
            reports,
            clock,
            grace_days: DEFAULT_GRACE_DAYS,
        }
    }

    /// Unreferenced files younger than this are left alone, since a fetch may
    /// have renamed them into place before committing their rows.
    pub fn with_grace_days(mut self, days: u32) -> Self {
        self.grace_days = days;
        self
    }

    /// Full consistency check, optionally repairing what it finds. Step
    /// failures are reported in `errors`; the report is always produced.
    pub async fn verify(&self, repair: bool, entity_limit: Option<usize>) -> IntegrityReport {
        let timer = Instant::now();
        info!(repair, ?entity_limit, "starting cache integrity verification");
        let mut findings = Findings::default();

        let scope = match entity_limit {
            Some(limit) => match self.albums.list_cached(Some(limit)).await {
                Ok(albums) => Some(albums.into_iter().map(|album| album.id).collect::<HashSet<_>>()),
                Err(e) => {
                    findings.step_failed("scope", e);
                    None
                }
            },
            None => None,
        };

        if let Err(e) = self.check_records(scope.as_ref(), &mut findings).await {
            findings.step_failed("records", e);
        }
        if let Err(e) = self.check_orphans(&mut findings).await {
            findings.step_failed("orphans", e);
        }
        if let Err(e) = self.check_decodable(&mut findings).await {
            findings.step_failed("corruption", e);
        }
        if let Err(e) = self.check_variants(entity_limit, &mut findings).await {
            findings.step_failed("variants", e);
        }
        if repair {
            self.repair(&mut findings).await;
        }

        let issues_found = findings.issue_count();
        let integrity_score = if findings.total_records == 0 {
            100.0
        } else {
            (100.0 - issues_found as f64 / findings.total_records as f64 * 100.0).max(0.0)
        };

        let mut report = IntegrityReport {
            timestamp: self.clock.now(),
            duration_seconds: timer.elapsed().as_secs_f64(),
            integrity_score: round2(integrity_score),
            repair,
            summary: IntegritySummary {
                total_records: findings.total_records,
                valid_files: findings.valid_files,
                issues_found,
                repairs_completed: findings.repaired.len(),
                repairs_failed: findings.failed_repairs.len(),
            },
            issues: IssueCounts {
                missing_files: findings.missing_files.len(),
                corrupted_files: findings.corrupted_files.len(),
                orphaned_files: findings.orphaned_files.len(),
                size_mismatches: findings.size_mismatches.len(),
                missing_variants: findings.missing_variants.len(),
            },
            details: IssueDetails {
                missing_files: first(&findings.missing_files),
                corrupted_files: first(&findings.corrupted_files),
                orphaned_files: first(&findings.orphaned_files),
                size_mismatches: first(&findings.size_mismatches),
                missing_variants: first(&findings.missing_variants),
                repaired: first(&findings.repaired),
                failed_repairs: findings.failed_repairs.clone(),
            },
            errors: findings.errors,
            report_path: None,
        };

        match self
            .reports
            .write(None, "integrity_report", report.timestamp, &report)
            .await
        {
            Ok(path) => report.report_path = Some(path),
            Err(e) => report.errors.push(format!("Failed to save integrity report: {e}")),
        }

        info!(
            score = report.integrity_score,
            issues = issues_found,
            repaired = report.summary.repairs_completed,
            "cache integrity verification finished"
        );
        report
    }

    /// Missing files and recorded/actual size mismatches.
    async fn check_records(
        &self,
        scope: Option<&HashSet<EntityId>>,
        findings: &mut Findings,
    ) -> Result<()> {
        let rows: Vec<CacheEntry> = self
            .entries
            .with_files(None)
            .await?
            .into_iter()
            .filter(|row| scope.is_none_or(|ids| ids.contains(&row.entity_id)))
            .collect();
        findings.total_records = rows.len();

        for row in rows {
            let Some(path) = row.file_path.clone() else {
                continue;
            };
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => match row.byte_size {
                    Some(expected) if expected > 0 && expected != meta.len() => {
                        findings.size_mismatches.push(SizeMismatch {
                            record_id: row.id,
                            entity_id: row.entity_id,
                            expected_size: expected,
                            actual_size: meta.len(),
                            file_path: path,
                        });
                    }
                    _ => findings.valid_files += 1,
                },
                _ => {
                    debug!(path = %path.display(), "indexed file missing");
                    findings.missing_files.push(MissingFile {
                        record_id: row.id,
                        entity_id: row.entity_id,
                        size_variant: row.size_variant,
                        file_path: path,
                    });
                }
            }
        }
        Ok(())
    }

    /// Image files in variant directories that no row references, older
    /// than the grace period.
    async fn check_orphans(&self, findings: &mut Findings) -> Result<()> {
        let referenced: HashSet<PathBuf> = self
            .entries
            .with_files(None)
            .await?
            .into_iter()
            .filter_map(|row| row.file_path)
            .collect();
        let now = self.clock.now();
        let grace = chrono::Duration::days(i64::from(self.grace_days));

        for file in self.layout.list_files().await? {
            if !self.layout.is_variant_file(&file.path)
                || !has_image_extension(&file.path)
                || referenced.contains(&file.path)
            {
                continue;
            }
            if now - file.modified <= grace {
                debug!(path = %file.path.display(), "unreferenced file within grace period");
                continue;
            }
            findings.orphaned_files.push(OrphanedFile {
                file_path: file.path,
                size: file.size,
                modified: file.modified,
            });
        }
        Ok(())
    }

    /// Decodes the first rows' files to catch corrupt payloads.
    async fn check_decodable(&self, findings: &mut Findings) -> Result<()> {
        for row in self.entries.with_files(Some(DECODE_SAMPLE)).await? {
            let Some(path) = row.file_path.clone() else {
                continue;
            };
            let Ok(bytes) = fs::read(&path).await else {
                continue;
            };
            let decoded = tokio::task::spawn_blocking(move || processor::decode(&bytes).map(|_| ()))
                .await
                .map_err(|e| ArtworkError::Internal(format!("Decode task failed: {e}")))?;
            if let Err(e) = decoded {
                findings.corrupted_files.push(CorruptedFile {
                    record_id: row.id,
                    entity_id: row.entity_id,
                    file_path: path,
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Albums flagged as cached that lack some variants on disk.
    async fn check_variants(&self, entity_limit: Option<usize>, findings: &mut Findings) -> Result<()> {
        for album in self.albums.list_cached(entity_limit).await? {
            let mut present = BTreeSet::new();
            for row in self.entries.list_for_entity(album.id).await? {
                if let Some(path) = &row.file_path
                    && file_exists(path).await
                {
                    present.insert(row.size_variant);
                }
            }
            let missing: Vec<SizeVariant> = SizeVariant::ALL
                .into_iter()
                .filter(|variant| !present.contains(variant))
                .collect();
            if missing.is_empty() {
                continue;
            }
            let has_original = present.contains(&SizeVariant::Original);
            findings.missing_variants.push(MissingVariants {
                entity_id: album.id,
                missing,
                has_original,
                can_rebuild: has_original,
            });
        }
        Ok(())
    }

    async fn repair(&self, findings: &mut Findings) {
        info!("repairing cache integrity issues");

        let missing_ids: Vec<Uuid> = findings.missing_files.iter().map(|m| m.record_id).collect();
        if !missing_ids.is_empty() {
            match self.entries.delete(&missing_ids).await {
                Ok(_) => {
                    for id in &missing_ids {
                        findings.record_repair("removed_missing_record", id.to_string());
                    }
                }
                Err(e) => findings.repair_failed("remove_record", format!("{} records", missing_ids.len()), e),
            }
        }

        let orphans: Vec<PathBuf> = findings.orphaned_files.iter().map(|o| o.file_path.clone()).collect();
        for path in orphans {
            match remove_file_if_exists(&path).await {
                Ok(_) => findings.record_repair("removed_orphaned_file", path.display().to_string()),
                Err(e) => findings.repair_failed("remove_file", path.display().to_string(), e),
            }
        }

        let rebuildable: Vec<MissingVariants> = findings
            .missing_variants
            .iter()
            .filter(|m| m.can_rebuild)
            .cloned()
            .collect();
        for missing in rebuildable {
            match self.rebuild(&missing).await {
                Ok(rebuilt) => {
                    for variant in rebuilt {
                        findings.record_repair(
                            "rebuilt_variant",
                            format!("album {} {variant}", missing.entity_id),
                        );
                    }
                }
                Err(e) => findings.repair_failed(
                    "rebuild_variant",
                    format!("album {}", missing.entity_id),
                    e,
                ),
            }
        }

        let affected: BTreeSet<EntityId> =
            findings.missing_files.iter().map(|m| m.entity_id).collect();
        for entity_id in affected {
            let still_cached = match self.entries.list_for_entity(entity_id).await {
                Ok(rows) => rows.iter().any(|row| row.file_path.is_some()),
                Err(e) => {
                    findings.repair_failed("clear_cached_flag", format!("album {entity_id}"), e);
                    continue;
                }
            };
            if !still_cached {
                match self.albums.clear_artwork_cached(entity_id).await {
                    Ok(()) => {
                        info!(entity_id, "album marked as not cached");
                        findings.record_repair("cleared_cached_flag", format!("album {entity_id}"));
                    }
                    Err(e) => findings.repair_failed("clear_cached_flag", format!("album {entity_id}"), e),
                }
            }
        }
    }

    /// Re-derives missing variants from the stored original.
    async fn rebuild(&self, missing: &MissingVariants) -> Result<Vec<SizeVariant>> {
        let original = self
            .entries
            .find_variant(missing.entity_id, SizeVariant::Original)
            .await?
            .ok_or_else(|| {
                ArtworkError::Integrity(format!("Album {} has no original", missing.entity_id))
            })?;
        let Some(source_path) = original.file_path.clone() else {
            return Err(ArtworkError::Integrity("Original has no file".into()));
        };
        if !file_exists(&source_path).await {
            return Err(ArtworkError::Integrity(format!(
                "Original {} is missing",
                source_path.display()
            )));
        }

        let targets: Vec<SizeVariant> = missing
            .missing
            .iter()
            .copied()
            .filter(|variant| *variant != SizeVariant::Original)
            .collect();
        let source = fs::read(&source_path).await?;
        let rendered = processor::render_all_blocking(source, targets).await?;

        let now = self.clock.now();
        let mut rows = Vec::with_capacity(rendered.len());
        let mut rebuilt = Vec::with_capacity(rendered.len());
        for variant in rendered {
            let path = self.layout.path_for(
                &original.cache_key,
                variant.variant,
                Some(processor::OUTPUT_EXTENSION),
            );
            write_atomically(&path, &variant.bytes).await?;

            let mut row = CacheEntry::new(
                original.entity_id,
                original.original_url.clone(),
                original.cache_key.clone(),
                variant.variant,
                now,
            )
            .with_file(path, variant.bytes.len() as u64);
            row.width = Some(variant.width);
            row.height = Some(variant.height);
            row.content_type = Some(processor::OUTPUT_CONTENT_TYPE.to_string());
            rows.push(row);
            rebuilt.push(variant.variant);
        }
        self.entries.upsert_many(rows).await?;

        info!(entity_id = missing.entity_id, rebuilt = rebuilt.len(), "rebuilt artwork variants");
        Ok(rebuilt)
    }

    /// Samples up to 50 rows with files and extrapolates missing files to
    /// the whole index.
    pub async fn quick_check(&self) -> Result<QuickCheckReport> {
        let total_records = self.entries.count().await?;
        let sample = self.entries.sample_with_files(QUICK_SAMPLE).await?;

        let mut sample_valid = 0;
        for row in &sample {
            if let Some(path) = &row.file_path
                && file_exists(path).await
            {
                sample_valid += 1;
            }
        }
        let sample_size = sample.len();
        let sample_missing = sample_size - sample_valid;

        let (estimated_missing, estimated_integrity_score) = if sample_size == 0 {
            (0, 100.0)
        } else {
            let missing_rate = sample_missing as f64 / sample_size as f64;
            (
                (missing_rate * total_records as f64) as u64,
                round2(sample_valid as f64 / sample_size as f64 * 100.0),
            )
        };

        let report = QuickCheckReport {
            timestamp: self.clock.now(),
            sample_size,
            total_records,
            sample_valid,
            sample_missing,
            estimated_missing,
            estimated_integrity_score,
        };
        debug!(score = report.estimated_integrity_score, "quick integrity check finished");
        Ok(report)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}
