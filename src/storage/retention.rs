//! Local retention
//!
//! Removes files in the backup directory whose modification time is older
//! than the retention window. Each file is handled on its own: a file that
//! cannot be removed is reported and the scan moves on.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::storage::artifact::{PARTIAL_SUFFIX, UPLOADED_MARKER_SUFFIX, marker_path_for};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// What to do with aged-out artifacts that were never confirmed uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnconfirmedPolicy {
    /// Keep them and report them (default)
    Keep,
    /// Remove them like any other aged-out file
    Prune,
}

/// A file retention tried and failed to remove
#[derive(Debug, Clone)]
pub struct PruneFailure {
    pub path: PathBuf,
    pub cause: String,
}

/// Outcome of one prune pass
#[derive(Debug, Default)]
pub struct PruneReport {
    /// Removed artifacts (sidecars and partial files not included)
    pub removed: Vec<PathBuf>,
    /// Aged-out artifacts kept because no upload was confirmed
    pub unconfirmed: Vec<PathBuf>,
    /// Per-file failures
    pub failures: Vec<PruneFailure>,
}

impl PruneReport {
    /// Number of removed artifacts
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }
}

/// Retention manager for one backup directory
pub struct RetentionManager {
    dir: PathBuf,
    window: Duration,
    policy: UnconfirmedPolicy,
    /// Paths whose removal is made to fail
    #[cfg(test)]
    undeletable: Vec<PathBuf>,
}

enum Entry {
    Artifact,
    Partial,
    Marker { artifact: PathBuf },
}

impl RetentionManager {
    /// # Arguments
    /// * `dir` - Backup directory (not descended into)
    /// * `window_days` - Files older than this many days are eligible
    /// * `policy` - Handling of aged-out artifacts without an upload marker
    pub fn new(dir: impl Into<PathBuf>, window_days: u32, policy: UnconfirmedPolicy) -> Self {
        Self {
            dir: dir.into(),
            window: Duration::from_secs(u64::from(window_days) * SECONDS_PER_DAY),
            policy,
            #[cfg(test)]
            undeletable: Vec::new(),
        }
    }

    /// Retention manager for the configured backup directory and window
    pub fn from_config(config: &AppConfig) -> Self {
        let policy = if config.backup.prune_unconfirmed {
            UnconfirmedPolicy::Prune
        } else {
            UnconfirmedPolicy::Keep
        };
        Self::new(
            config.backup.backup_dir.clone(),
            config.backup.keep_days,
            policy,
        )
    }

    /// Prune against the current time
    pub async fn prune(&self) -> Result<PruneReport, AppError> {
        self.prune_at(SystemTime::now()).await
    }

    /// Prune as if the current time were `now`
    ///
    /// A file is eligible when `now - mtime` strictly exceeds the window.
    ///
    /// # Errors
    /// Only if the directory itself cannot be listed; per-file problems end
    /// up in `PruneReport::failures`.
    pub async fn prune_at(&self, now: SystemTime) -> Result<PruneReport, AppError> {
        tracing::info!(
            dir = %self.dir.display(),
            window_days = self.window.as_secs() / SECONDS_PER_DAY,
            "Pruning old backups..."
        );

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            AppError::Storage(format!(
                "Failed to read backup directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut report = PruneReport::default();
        let mut aged_markers = Vec::new();

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    report.failures.push(PruneFailure {
                        path: self.dir.clone(),
                        cause: e.to_string(),
                    });
                    break;
                }
            };
            let path = entry.path();

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // removed earlier in this pass together with its artifact
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    record_failure(&mut report, path, e.to_string());
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let modified = match metadata.modified() {
                Ok(modified) => modified,
                Err(e) => {
                    record_failure(&mut report, path, e.to_string());
                    continue;
                }
            };
            // mtime in the future means age zero
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= self.window {
                continue;
            }

            match classify(&path) {
                Entry::Marker { artifact } => aged_markers.push((path, artifact)),
                Entry::Partial => {
                    if self.remove(&mut report, &path).await {
                        tracing::info!(path = %path.display(), "Removed stale partial export");
                    }
                }
                Entry::Artifact => {
                    let marker = marker_path_for(&path);
                    let confirmed = marker.is_file();
                    if !confirmed && self.policy == UnconfirmedPolicy::Keep {
                        tracing::warn!(
                            path = %path.display(),
                            "Keeping aged-out backup that was never confirmed uploaded"
                        );
                        report.unconfirmed.push(path);
                        continue;
                    }

                    if self.remove(&mut report, &path).await {
                        tracing::info!(path = %path.display(), "Removed old backup");
                        report.removed.push(path);
                        if confirmed {
                            self.remove(&mut report, &marker).await;
                        }
                    }
                }
            }
        }

        // Markers go with their artifact; only orphans are removed on their own.
        for (marker, artifact) in aged_markers {
            if !artifact.exists() && marker.exists() {
                self.remove(&mut report, &marker).await;
            }
        }

        tracing::info!(
            removed = report.removed.len(),
            unconfirmed = report.unconfirmed.len(),
            failures = report.failures.len(),
            "Prune finished"
        );
        Ok(report)
    }
}

impl RetentionManager {
    async fn remove(&self, report: &mut PruneReport, path: &Path) -> bool {
        match self.remove_file(path).await {
            Ok(()) => true,
            Err(e) => {
                record_failure(report, path.to_path_buf(), e.to_string());
                false
            }
        }
    }

    #[cfg(not(test))]
    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    #[cfg(test)]
    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        if self.undeletable.iter().any(|undeletable| undeletable == path) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "permission denied",
            ));
        }
        tokio::fs::remove_file(path).await
    }
}

fn classify(path: &Path) -> Entry {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if let Some(artifact) = name.strip_suffix(UPLOADED_MARKER_SUFFIX) {
        Entry::Marker {
            artifact: path.with_file_name(artifact),
        }
    } else if name.ends_with(PARTIAL_SUFFIX) {
        Entry::Partial
    } else {
        Entry::Artifact
    }
}


fn record_failure(report: &mut PruneReport, path: PathBuf, cause: String) {
    tracing::warn!(path = %path.display(), error = %cause, "Failed to prune file");
    report.failures.push(PruneFailure { path, cause });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(SECONDS_PER_DAY);

    fn file_aged(dir: &Path, name: &str, now: SystemTime, age: Duration) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"backup").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(now - age).unwrap();
        path
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn removes_only_files_older_than_window() {
        let temp_dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        for days in [2, 6, 7, 8, 30] {
            file_aged(temp_dir.path(), &format!("db_{:02}.zip", days), now, DAY * days);
        }

        let manager = RetentionManager::new(temp_dir.path(), 7, UnconfirmedPolicy::Prune);
        let report = manager.prune_at(now).await.unwrap();

        assert_eq!(report.removed_count(), 2);
        assert_eq!(
            listing(temp_dir.path()),
            vec!["db_02.zip", "db_06.zip", "db_07.zip"]
        );
    }

    #[tokio::test]
    async fn second_pass_removes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        file_aged(temp_dir.path(), "db_old.zip", now, DAY * 10);

        let manager = RetentionManager::new(temp_dir.path(), 7, UnconfirmedPolicy::Prune);
        assert_eq!(manager.prune_at(now).await.unwrap().removed_count(), 1);
        assert_eq!(manager.prune_at(now).await.unwrap().removed_count(), 0);
    }

    #[tokio::test]
    async fn zero_day_window_keeps_files_of_age_zero() {
        let temp_dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        file_aged(temp_dir.path(), "fresh.zip", now, Duration::ZERO);
        file_aged(temp_dir.path(), "older.zip", now, Duration::from_secs(1));

        let manager = RetentionManager::new(temp_dir.path(), 0, UnconfirmedPolicy::Prune);
        let report = manager.prune_at(now).await.unwrap();

        assert_eq!(report.removed_count(), 1);
        assert_eq!(listing(temp_dir.path()), vec!["fresh.zip"]);
    }

    #[tokio::test]
    async fn keeps_unconfirmed_artifacts_by_default() {
        let temp_dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        file_aged(temp_dir.path(), "db_confirmed.zip", now, DAY * 9);
        file_aged(temp_dir.path(), "db_confirmed.zip.uploaded", now, DAY * 9);
        file_aged(temp_dir.path(), "db_unconfirmed.zip", now, DAY * 9);

        let manager = RetentionManager::new(temp_dir.path(), 7, UnconfirmedPolicy::Keep);
        let report = manager.prune_at(now).await.unwrap();

        assert_eq!(report.removed_count(), 1);
        assert_eq!(report.unconfirmed.len(), 1);
        assert_eq!(listing(temp_dir.path()), vec!["db_unconfirmed.zip"]);
    }

    #[tokio::test]
    async fn removes_stale_partials_and_orphan_markers() {
        let temp_dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        file_aged(temp_dir.path(), "db_a.zip.part", now, DAY * 9);
        file_aged(temp_dir.path(), "db_gone.zip.uploaded", now, DAY * 9);
        file_aged(temp_dir.path(), "db_new.zip.part", now, DAY);

        let manager = RetentionManager::new(temp_dir.path(), 7, UnconfirmedPolicy::Keep);
        let report = manager.prune_at(now).await.unwrap();

        assert_eq!(report.removed_count(), 0);
        assert!(report.failures.is_empty());
        assert_eq!(listing(temp_dir.path()), vec!["db_new.zip.part"]);
    }

    #[tokio::test]
    async fn does_not_descend_into_subdirectories() {
        let temp_dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let nested = temp_dir.path().join("archive");
        std::fs::create_dir(&nested).unwrap();
        file_aged(&nested, "db_ancient.zip", now, DAY * 100);

        let manager = RetentionManager::new(temp_dir.path(), 7, UnconfirmedPolicy::Prune);
        let report = manager.prune_at(now).await.unwrap();

        assert_eq!(report.removed_count(), 0);
        assert!(nested.join("db_ancient.zip").exists());
    }

    #[tokio::test]
    async fn failed_removal_is_reported_and_scan_continues() {
        let temp_dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let stuck = file_aged(temp_dir.path(), "db_stuck.zip", now, DAY * 10);
        file_aged(temp_dir.path(), "db_old.zip", now, DAY * 10);
        file_aged(temp_dir.path(), "db_older.zip", now, DAY * 20);
        file_aged(temp_dir.path(), "db_fresh.zip", now, DAY);

        let mut manager = RetentionManager::new(temp_dir.path(), 7, UnconfirmedPolicy::Prune);
        manager.undeletable.push(stuck.clone());
        let report = manager.prune_at(now).await.unwrap();

        assert_eq!(report.removed_count(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, stuck);
        assert!(report.failures[0].cause.contains("permission denied"));
        assert_eq!(listing(temp_dir.path()), vec!["db_fresh.zip", "db_stuck.zip"]);
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let manager = RetentionManager::new(temp_dir.path().join("absent"), 7, UnconfirmedPolicy::Prune);

        tokio_test::assert_err!(manager.prune().await);
    }
}
