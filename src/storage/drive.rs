//! Google Drive uploader
//!
//! Sends a finished artifact to Drive as one `multipart/related` request:
//! JSON metadata first, file bytes second.

use serde::Deserialize;

use crate::auth::AuthSession;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::storage::artifact::{BackupArtifact, UploadReceipt};
use crate::storage::build_http_client;

const MULTIPART_BOUNDARY: &str = "odoo_backup_artifact_boundary";

/// Uploads artifacts to Google Drive
pub struct DriveUploader {
    client: reqwest::Client,
    /// Media upload endpoint
    upload_url: String,
    /// Optional parent folder
    folder_id: Option<String>,
}

/// Subset of the Drive `File` resource returned after upload
#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    name: Option<String>,
}

impl DriveUploader {
    /// Create an uploader from configuration
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &AppConfig) -> Result<Self, AppError> {
        let client = build_http_client(config.http.connect_timeout(), config.http.upload_timeout())?;

        Ok(Self {
            client,
            upload_url: config.google_drive.upload_url.clone(),
            folder_id: config
                .google_drive
                .folder_id
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        })
    }

    /// Upload `artifact` using `session`
    ///
    /// The remote object is named after the artifact's basename. The local
    /// file is only read; it is left in place whatever the outcome.
    ///
    /// # Errors
    /// Returns `Upload` for unreadable files, transport failures and any
    /// non-success response from Drive.
    pub async fn upload(
        &self,
        session: &AuthSession,
        artifact: &BackupArtifact,
    ) -> Result<UploadReceipt, AppError> {
        let name = artifact.file_name();
        tracing::info!(path = %artifact.path.display(), name = %name, "Uploading to Google Drive...");

        let data = tokio::fs::read(&artifact.path).await.map_err(|e| {
            AppError::Upload(format!(
                "Failed to read artifact {}: {}",
                artifact.path.display(),
                e
            ))
        })?;
        let size = data.len() as u64;
        let body = self.multipart_body(&name, data)?;

        let response = self
            .client
            .post(&self.upload_url)
            .query(&[("uploadType", "multipart"), ("fields", "id,name")])
            .bearer_auth(&session.access_token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Upload(format!("Drive request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upload(format!(
                "Drive answered HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| AppError::Upload(format!("Unexpected Drive response: {}", e)))?;

        tracing::info!(file_id = %file.id, name = %name, bytes = size, "Upload completed");

        Ok(UploadReceipt {
            file_id: file.id,
            name: file.name.unwrap_or(name),
            size,
        })
    }

    fn multipart_body(&self, name: &str, data: Vec<u8>) -> Result<Vec<u8>, AppError> {
        let mut metadata = serde_json::json!({ "name": name });
        if let Some(folder_id) = &self.folder_id {
            metadata["parents"] = serde_json::json!([folder_id]);
        }
        let metadata = serde_json::to_string(&metadata).map_err(|e| AppError::Internal(e.into()))?;

        let mut body = Vec::with_capacity(data.len() + metadata.len() + 256);
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{m}\r\n--{b}\r\nContent-Type: application/octet-stream\r\n\r\n",
                b = MULTIPART_BOUNDARY,
                m = metadata
            )
            .as_bytes(),
        );
        body.extend_from_slice(&data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
        Ok(body)
    }
}
