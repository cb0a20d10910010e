use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

/// Marker embedded in the names of in-flight temporary files.
pub(crate) const TMP_MARKER: &str = ".annotmp.";

/// Outcome of a temporary file sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    pub failed: usize,
}

/// Removes temporary files older than `threshold` and prunes empty shard directories.
pub(crate) fn purge_tmp(root: &Path, threshold: Duration) -> PurgeReport {
    let report = remove_stale(root, SystemTime::now(), threshold);
    if report.removed > 0 || report.failed > 0 {
        info!(removed = report.removed, failed = report.failed, "Cleaned up temporary files");
    }
    report
}

fn remove_stale(root: &Path, now: SystemTime, threshold: Duration) -> PurgeReport {
    let mut report = PurgeReport::default();

    WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .flatten()
        .filter(|e| e.path() != root)
        .for_each(|entry| {
            let path = entry.path();

            if entry.file_type().is_file() {
                if is_tmp(&entry) && is_stale(&entry, now, threshold) {
                    match std::fs::remove_file(path) {
                        Ok(()) => report.removed += 1,
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Temp file removal failed");
                            report.failed += 1;
                        },
                    }
                }
            } else if entry.file_type().is_dir() {
                // Only succeeds on empty directories.
                let _ = std::fs::remove_dir(path);
            }
        });

    report
}

fn is_tmp(entry: &DirEntry) -> bool {
    entry.file_name().to_str().is_some_and(|name| name.contains(TMP_MARKER))
}

fn is_stale(entry: &DirEntry, now: SystemTime, threshold: Duration) -> bool {
    entry
        .metadata()
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|modified| now.duration_since(modified).ok())
        .is_none_or(|age| age >= threshold)
}
