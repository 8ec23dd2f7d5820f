//! Backup artifacts and their upload markers
//!
//! An artifact's identity is its filename,
//! `{database}_{YYYYMMDD}_{HHMMSS}.{extension}`, so lexical order of the
//! backup directory matches creation order.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::BackupFormat;
use crate::error::AppError;

/// Timestamp layout embedded in artifact filenames
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Suffix of the sidecar written once an artifact is confirmed uploaded
pub const UPLOADED_MARKER_SUFFIX: &str = ".uploaded";

/// Suffix of an artifact still being written
pub const PARTIAL_SUFFIX: &str = ".part";

/// One exported database snapshot on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    /// Source database identifier (filename prefix)
    pub database: String,
    /// Creation time, second precision
    pub created_at: NaiveDateTime,
    /// Storage format
    pub format: BackupFormat,
    /// Full local path
    pub path: PathBuf,
}

impl BackupArtifact {
    /// Derive the artifact for `database` created at `created_at` under `dir`
    pub fn new<Tz: TimeZone>(
        dir: &Path,
        database: &str,
        created_at: &DateTime<Tz>,
        format: BackupFormat,
    ) -> Self {
        let created_at = created_at.naive_local();
        let filename = artifact_file_name(database, &created_at, format);
        Self {
            database: database.to_string(),
            created_at,
            format,
            path: dir.join(filename),
        }
    }

    /// Artifact named after the current local time
    pub fn now(dir: &Path, database: &str, format: BackupFormat) -> Self {
        Self::new(dir, database, &Local::now(), format)
    }

    /// Basename, also used as the remote object name
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Path the exporter streams into before publishing the artifact
    pub fn partial_path(&self) -> PathBuf {
        append_suffix(&self.path, PARTIAL_SUFFIX)
    }

    /// Path of the upload confirmation sidecar
    pub fn marker_path(&self) -> PathBuf {
        marker_path_for(&self.path)
    }

    /// Size on disk
    pub async fn size(&self) -> Result<u64, AppError> {
        tokio::fs::metadata(&self.path)
            .await
            .map(|metadata| metadata.len())
            .map_err(|e| {
                AppError::Storage(format!(
                    "Failed to stat artifact {}: {}",
                    self.path.display(),
                    e
                ))
            })
    }

    /// Whether an upload marker exists for this artifact
    pub fn is_uploaded(&self) -> bool {
        self.marker_path().is_file()
    }

    /// Record a confirmed upload next to the artifact
    pub async fn mark_uploaded(&self, receipt: &UploadReceipt) -> Result<(), AppError> {
        let marker = UploadMarker {
            file_id: receipt.file_id.clone(),
            name: receipt.name.clone(),
            size: receipt.size,
            uploaded_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&marker).map_err(|e| AppError::Internal(e.into()))?;
        let path = self.marker_path();
        tokio::fs::write(&path, body).await.map_err(|e| {
            AppError::Storage(format!(
                "Failed to write upload marker {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// `{database}_{YYYYMMDD}_{HHMMSS}.{extension}`
pub fn artifact_file_name(database: &str, created_at: &NaiveDateTime, format: BackupFormat) -> String {
    format!(
        "{}_{}.{}",
        database,
        created_at.format(TIMESTAMP_FORMAT),
        format.extension()
    )
}

/// Sidecar marker path for an artifact path
pub fn marker_path_for(path: &Path) -> PathBuf {
    append_suffix(path, UPLOADED_MARKER_SUFFIX)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Remote object ID
    pub file_id: String,
    /// Remote object name (artifact basename)
    pub name: String,
    /// Bytes sent
    pub size: u64,
}

/// Contents of an `.uploaded` sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMarker {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}
