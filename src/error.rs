//! Error types for odoo-backup
//!
//! Every stage failure is converted to `AppError`, which also knows
//! the process exit code the CLI reports for it.

use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;

/// Application-wide error type
///
/// Variants are grouped by pipeline stage so the scheduler invoking the
/// binary can tell an export failure from an authorization failure by
/// exit code alone.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration file not found (exit 2)
    #[error("Configuration file not found: {}", .0.display())]
    ConfigMissing(PathBuf),

    /// Invalid configuration (exit 2)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backup endpoint answered with a non-success status (exit 3)
    #[error("Export failed with HTTP {status}: {body}")]
    ExportStatus { status: u16, body: String },

    /// Backup endpoint unreachable (exit 3)
    #[error("Export request failed: {0}")]
    ExportTransport(#[source] reqwest::Error),

    /// No stored credential and the run is unattended (exit 4)
    #[error(
        "No stored Google Drive credential at {}; run `odoo-backup authorize` first",
        .0.display()
    )]
    AuthorizationRequired(PathBuf),

    /// Interactive authorization flow failed (exit 4)
    #[error("Authorization failed: {0}")]
    AuthFlow(String),

    /// Token refresh failed (exit 4)
    #[error("Token refresh failed: {0}")]
    AuthRefresh(String),

    /// Remote storage rejected or never received the upload (exit 5)
    #[error("Upload failed: {0}")]
    Upload(String),

    /// Local filesystem error (exit 1)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error (exit 1)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// Short label used for logs and the `status` metric label
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ConfigMissing(_) | AppError::Config(_) => "config",
            AppError::ExportStatus { .. } | AppError::ExportTransport(_) => "export",
            AppError::AuthorizationRequired(_) | AppError::AuthFlow(_) | AppError::AuthRefresh(_) => {
                "auth"
            }
            AppError::Upload(_) => "upload",
            AppError::Storage(_) => "storage",
            AppError::Internal(_) => "internal",
        }
    }

    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::ConfigMissing(_) | AppError::Config(_) => 2,
            AppError::ExportStatus { .. } | AppError::ExportTransport(_) => 3,
            AppError::AuthorizationRequired(_) | AppError::AuthFlow(_) | AppError::AuthRefresh(_) => 4,
            AppError::Upload(_) => 5,
            AppError::Storage(_) | AppError::Internal(_) => 1,
        }
    }
}

impl From<&AppError> for ExitCode {
    fn from(err: &AppError) -> Self {
        ExitCode::from(err.exit_code())
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
