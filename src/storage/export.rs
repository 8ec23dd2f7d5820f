//! Database export from Odoo's database manager
//!
//! Calls `POST /web/database/backup` and streams the response body to a
//! timestamped file in the backup directory.

use std::path::Path;

use tokio::io::{AsyncWriteExt, BufWriter};

use crate::config::{AppConfig, BackupFormat};
use crate::error::AppError;
use crate::storage::artifact::BackupArtifact;
use crate::storage::build_http_client;

/// Write buffer size for the export stream
const EXPORT_CHUNK_BYTES: usize = 64 * 1024;

/// Exports one database per call
pub struct Exporter {
    client: reqwest::Client,
    endpoint: String,
    /// Filename prefix
    database_label: String,
    /// Database to export
    database_name: String,
    master_password: String,
    format: BackupFormat,
}

impl Exporter {
    /// Create an exporter from configuration
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &AppConfig) -> Result<Self, AppError> {
        let client = build_http_client(config.http.connect_timeout(), config.http.export_timeout())?;

        Ok(Self {
            client,
            endpoint: config.backup_endpoint(),
            database_label: config.odoo.db.clone(),
            database_name: config.odoo.database_name.clone(),
            master_password: config.odoo.master_password.clone(),
            format: config.backup.backup_format,
        })
    }

    /// Export the database into `target_dir`
    ///
    /// `target_dir` must already exist. The body is written to a `.part`
    /// file and moved into place only after it is completely flushed,
    /// so a failed export never leaves something that looks like a
    /// finished artifact.
    ///
    /// # Errors
    /// - `ExportStatus` for any non-200 response
    /// - `ExportTransport` for connection, timeout or body stream failures
    /// - `Storage` if the file cannot be written or would overwrite an artifact
    pub async fn export(&self, target_dir: &Path) -> Result<BackupArtifact, AppError> {
        let artifact = BackupArtifact::now(target_dir, &self.database_label, self.format);
        if tokio::fs::try_exists(&artifact.path).await.unwrap_or(false) {
            return Err(AppError::Storage(format!(
                "Refusing to overwrite existing artifact {}",
                artifact.path.display()
            )));
        }

        tracing::info!(
            database = %self.database_name,
            format = self.format.tag(),
            endpoint = %self.endpoint,
            "Starting database export..."
        );

        let params = [
            ("master_pwd", self.master_password.as_str()),
            ("name", self.database_name.as_str()),
            ("backup_format", self.format.tag()),
        ];
        let response = self
            .client
            .post(&self.endpoint)
            .form(&params)
            .send()
            .await
            .map_err(AppError::ExportTransport)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to read error body from backup endpoint");
                    String::new()
                }
            };
            tracing::error!(status = status.as_u16(), body = %body, "Backup endpoint refused export");
            return Err(AppError::ExportStatus {
                status: status.as_u16(),
                body,
            });
        }

        let partial_path = artifact.partial_path();
        let written = match write_body(response, &partial_path).await {
            Ok(bytes) => publish(&partial_path, &artifact.path).await.map(|()| bytes),
            Err(error) => Err(error),
        };

        match written {
            Ok(bytes) => {
                tracing::info!(path = %artifact.path.display(), bytes, "Backup artifact created");
                Ok(artifact)
            }
            Err(error) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial_path).await {
                    tracing::warn!(
                        path = %partial_path.display(),
                        error = %cleanup,
                        "Failed to remove partial artifact"
                    );
                }
                Err(error)
            }
        }
    }
}

/// Move the finished `.part` file to `target` without replacing anything
///
/// `hard_link` fails if `target` already exists, unlike `rename`.
async fn publish(partial_path: &Path, target: &Path) -> Result<(), AppError> {
    tokio::fs::hard_link(partial_path, target)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => AppError::Storage(format!(
                "Refusing to overwrite existing artifact {}",
                target.display()
            )),
            _ => AppError::Storage(format!(
                "Failed to move {} into place: {}",
                partial_path.display(),
                e
            )),
        })?;

    if let Err(e) = tokio::fs::remove_file(partial_path).await {
        tracing::warn!(path = %partial_path.display(), error = %e, "Failed to remove partial artifact");
    }
    Ok(())
}

/// Stream the response body to `path`, returning the byte count
async fn write_body(mut response: reqwest::Response, path: &Path) -> Result<u64, AppError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to create {}: {}", path.display(), e)))?;
    let mut writer = BufWriter::with_capacity(EXPORT_CHUNK_BYTES, file);
    let write_error =
        |e: std::io::Error| AppError::Storage(format!("Failed to write {}: {}", path.display(), e));

    let mut written = 0_u64;
    while let Some(chunk) = response.chunk().await.map_err(AppError::ExportTransport)? {
        writer.write_all(&chunk).await.map_err(write_error)?;
        written += chunk.len() as u64;
    }

    writer.flush().await.map_err(write_error)?;
    writer.get_ref().sync_all().await.map_err(write_error)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn publish_moves_partial_into_place() {
        let temp_dir = TempDir::new().unwrap();
        let partial = temp_dir.path().join("db_20240101_120000.zip.part");
        let target = temp_dir.path().join("db_20240101_120000.zip");
        std::fs::write(&partial, b"archive").unwrap();

        publish(&partial, &target).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"archive");
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn publish_never_replaces_existing_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let partial = temp_dir.path().join("db_20240101_120000.zip.part");
        let target = temp_dir.path().join("db_20240101_120000.zip");
        std::fs::write(&partial, b"second").unwrap();
        std::fs::write(&target, b"ORIGINAL").unwrap();

        let error = publish(&partial, &target).await.unwrap_err();

        assert!(matches!(&error, AppError::Storage(message) if message.contains("overwrite")));
        assert_eq!(std::fs::read(&target).unwrap(), b"ORIGINAL");
    }
}
