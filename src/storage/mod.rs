//! Local and remote backup storage
//!
//! Handles:
//! - Database export to local disk
//! - Upload to Google Drive
//! - Local retention

mod artifact;
mod drive;
mod export;
mod retention;

pub use artifact::{
    BackupArtifact, UploadMarker, UploadReceipt, artifact_file_name, marker_path_for,
};
pub use drive::DriveUploader;
pub use export::Exporter;
pub use retention::{PruneFailure, PruneReport, RetentionManager, UnconfirmedPolicy};

use std::time::Duration;

use crate::error::AppError;

/// HTTP client with explicit connect and whole-request timeouts
pub(crate) fn build_http_client(
    connect_timeout: Duration,
    timeout: Duration,
) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .user_agent(concat!("odoo-backup/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(connect_timeout)
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Internal(e.into()))
}
