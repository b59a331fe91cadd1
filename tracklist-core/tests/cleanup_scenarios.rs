mod common;

use chrono::Duration;
use std::fs::File;
use std::path::Path;
use std::time::SystemTime;
use tracklist_core::cleanup::CleanupConfig;
use tracklist_core::clock::Clock;
use tracklist_core::database::ports::cache_entries::CacheEntryRepository;
use tracklist_core::{CacheEntry, SizeVariant};

fn set_age(path: &Path, days: u64) {
    let mtime = SystemTime::now() - std::time::Duration::from_secs(days * 86_400);
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(mtime)
        .unwrap();
}

async fn seed_entry(stack: &common::Stack, key: &str, accessed_days: i64, fetched_days: i64) {
    let now = stack.clock.now();
    let path = stack.layout.path_for(key, SizeVariant::Medium, None);
    tokio::fs::write(&path, vec![7u8; 64]).await.unwrap();
    let mut entry = CacheEntry::new(1, format!("https://x/{key}.jpg"), key, SizeVariant::Medium, now)
        .with_file(path, 64);
    entry.last_accessed_at = now - Duration::days(accessed_days);
    entry.last_fetched_at = now - Duration::days(fetched_days);
    stack.entries.upsert(entry).await.unwrap();
}

async fn seed_orphan(stack: &common::Stack, key: &str, age_days: u64) -> std::path::PathBuf {
    let path = stack.layout.path_for(key, SizeVariant::Small, None);
    tokio::fs::write(&path, vec![1u8; 32]).await.unwrap();
    set_age(&path, age_days);
    path
}

async fn seed_mixed(stack: &common::Stack) {
    seed_entry(stack, "stale", 400, 400).await;
    seed_entry(stack, "recently_used", 20, 400).await;
    seed_entry(stack, "fresh", 2, 2).await;
    seed_orphan(stack, "old_orphan", 30).await;
    seed_orphan(stack, "new_orphan", 3).await;
    seed_entry(stack, "dangling", 5, 10).await;
    tokio::fs::remove_file(stack.layout.path_for("dangling", SizeVariant::Medium, None))
        .await
        .unwrap();
}

#[tokio::test]
async fn minimum_retention_wins_over_age() {
    let stack = common::stack().await;
    seed_entry(&stack, "stale", 400, 400).await;
    seed_entry(&stack, "recently_used", 20, 400).await;

    let run = stack.cleanup.cleanup(CleanupConfig::default()).await.unwrap();
    assert_eq!(run.records_deleted, 1);

    let keys: Vec<String> = stack
        .entries
        .all()
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.cache_key)
        .collect();
    assert_eq!(keys, vec!["recently_used".to_string()]);
}

#[tokio::test]
async fn orphans_inside_grace_period_survive() {
    let stack = common::stack().await;
    let old = seed_orphan(&stack, "old_orphan", 30).await;
    let new = seed_orphan(&stack, "new_orphan", 3).await;

    let run = stack.cleanup.cleanup(CleanupConfig::default()).await.unwrap();
    assert_eq!(run.orphaned_files, 1);
    assert!(!old.exists());
    assert!(new.exists());
}

#[tokio::test]
async fn second_run_deletes_nothing() {
    let stack = common::stack().await;
    seed_mixed(&stack).await;

    let first = stack.cleanup.cleanup(CleanupConfig::default()).await.unwrap();
    assert_eq!(first.records_deleted, 2);
    assert_eq!(first.orphaned_files, 1);
    assert_eq!(first.invalid_records, 1);

    let second = stack.cleanup.cleanup(CleanupConfig::default()).await.unwrap();
    assert_eq!(second.records_deleted, 0);
    assert_eq!(second.files_deleted, 0);
    assert!(second.errors.is_empty());
}

#[tokio::test]
async fn dry_run_matches_real_run_without_side_effects() {
    let dry_stack = common::stack().await;
    seed_mixed(&dry_stack).await;
    let real_stack = common::stack().await;
    seed_mixed(&real_stack).await;

    let config = CleanupConfig {
        max_cache_size_mb: Some(1),
        ..CleanupConfig::default()
    };
    let rows_before = dry_stack.entries.count().await.unwrap();
    let files_before = dry_stack.layout.list_files().await.unwrap().len();

    let dry = dry_stack
        .cleanup
        .cleanup(CleanupConfig {
            dry_run: true,
            ..config.clone()
        })
        .await
        .unwrap();
    let real = real_stack.cleanup.cleanup(config).await.unwrap();

    assert!(dry.dry_run);
    assert_eq!(dry.records_deleted, real.records_deleted);
    assert_eq!(dry.files_deleted, real.files_deleted);
    assert_eq!(dry.orphaned_files, real.orphaned_files);
    assert_eq!(dry.invalid_records, real.invalid_records);
    assert_eq!(dry.bytes_freed, real.bytes_freed);
    assert_eq!(dry.files_scanned, real.files_scanned);

    assert_eq!(dry_stack.entries.count().await.unwrap(), rows_before);
    assert_eq!(dry_stack.layout.list_files().await.unwrap().len(), files_before);
    assert!(dry.report_path.unwrap().starts_with(dry_stack.dir.path()));
    assert!(dry_stack.cache_root().exists());
}
