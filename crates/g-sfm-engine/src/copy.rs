//! ---
//! sfm_section: "02-fleet-engine"
//! sfm_subsection: "module"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Fleet orchestration engine: locks, shutdown, updates, backup, scheduling."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Recursive tree copy with an optional "smart" skip mode.
//!
//! Smart mode skips files whose destination already has an equal-or-newer
//! modification time and identical length, bounding distribution cost to
//! changed files. Individual copy failures (sharing violations while a
//! server is mid-exit) are retried a bounded number of times before
//! propagating.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub copied: usize,
    pub skipped: usize,
}

/// Copy the tree rooted at `src` into `dst`.
pub async fn copy_tree(
    src: &Path,
    dst: &Path,
    smart: bool,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<CopyStats> {
    copy_tree_excluding(src, dst, &[], smart, max_attempts, retry_delay).await
}

/// Like [`copy_tree`], but `exclude` names top-level entries of `src`
/// that are not distributed (package tool bookkeeping, marker files).
pub async fn copy_tree_excluding(
    src: &Path,
    dst: &Path,
    exclude: &[&str],
    smart: bool,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<CopyStats> {
    if !src.is_dir() {
        return Err(EngineError::CacheNotFound(src.to_path_buf()));
    }
    let mut stats = CopyStats::default();
    let walker = WalkDir::new(src).into_iter().filter_entry(|entry| {
        entry.depth() != 1
            || !entry
                .file_name()
                .to_str()
                .is_some_and(|name| exclude.contains(&name))
    });
    for entry in walker.filter_map(|e| e.ok()) {
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| EngineError::Store(err.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if smart && up_to_date(entry.path(), &target) {
            trace!(file = %target.display(), "smart copy skip");
            stats.skipped += 1;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_file_with_retry(entry.path(), &target, max_attempts, retry_delay).await?;
        stats.copied += 1;
    }
    debug!(src = %src.display(), dst = %dst.display(), copied = stats.copied, skipped = stats.skipped, "tree copy complete");
    Ok(stats)
}

fn up_to_date(src: &Path, dst: &Path) -> bool {
    let (Ok(src_meta), Ok(dst_meta)) = (fs::metadata(src), fs::metadata(dst)) else {
        return false;
    };
    if src_meta.len() != dst_meta.len() {
        return false;
    }
    match (src_meta.modified(), dst_meta.modified()) {
        (Ok(src_mtime), Ok(dst_mtime)) => dst_mtime >= src_mtime,
        _ => false,
    }
}

async fn copy_file_with_retry(
    src: &Path,
    dst: &Path,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<()> {
    let attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fs::copy(src, dst) {
            Ok(_) => return Ok(()),
            Err(err) if attempt < attempts => {
                warn!(
                    file = %dst.display(),
                    attempt,
                    error = %err,
                    "file copy failed, retrying"
                );
                tokio::time::sleep(retry_delay).await;
            }
            Err(err) => return Err(EngineError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn copies_nested_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("a.bin"), "alpha");
        write(&src.join("nested/b.bin"), "bravo");

        let stats = copy_tree(&src, &dst, true, 3, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(stats.copied, 2);
        assert_eq!(fs::read_to_string(dst.join("nested/b.bin")).unwrap(), "bravo");
    }

    #[tokio::test]
    async fn second_smart_copy_writes_nothing() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("a.bin"), "alpha");
        write(&src.join("b.bin"), "bravo");

        let first = copy_tree(&src, &dst, true, 3, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(first.copied, 2);

        let second = copy_tree(&src, &dst, true, 3, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(second.copied, 0);
        assert_eq!(second.skipped, 2);
    }

    #[tokio::test]
    async fn length_change_defeats_smart_skip() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("a.bin"), "alpha");
        copy_tree(&src, &dst, true, 3, Duration::from_millis(1))
            .await
            .unwrap();

        write(&src.join("a.bin"), "alpha-and-more");
        let stats = copy_tree(&src, &dst, true, 3, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(stats.copied, 1);
        assert_eq!(
            fs::read_to_string(dst.join("a.bin")).unwrap(),
            "alpha-and-more"
        );
    }

    #[tokio::test]
    async fn excluded_top_level_entries_stay_behind() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("bin/server"), "payload");
        write(&src.join("steamapps/state.acf"), "bookkeeping");
        write(&src.join(".build-stamp"), "2024-01-01T00:00:00Z");

        let stats = copy_tree_excluding(
            &src,
            &dst,
            &["steamapps", ".build-stamp"],
            true,
            3,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(stats.copied, 1);
        assert!(dst.join("bin/server").is_file());
        assert!(!dst.join("steamapps").exists());
        assert!(!dst.join(".build-stamp").exists());
    }

    #[tokio::test]
    async fn missing_source_is_cache_not_found() {
        let dir = tempdir().unwrap();
        let result = copy_tree(
            &dir.path().join("ghost"),
            &dir.path().join("dst"),
            true,
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(result, Err(EngineError::CacheNotFound(_))));
    }
}
