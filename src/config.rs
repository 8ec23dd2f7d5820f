//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/backup.toml unless overridden)
//! 3. Environment variables (override)
//!
//! The result is an immutable `AppConfig` handed to each component
//! explicitly; nothing reads configuration from global state.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppError;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/backup.toml";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub odoo: OdooConfig,
    pub backup: BackupConfig,
    pub google_drive: GoogleDriveConfig,
    pub http: HttpConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Source system (Odoo server) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OdooConfig {
    /// Base URL (e.g., "http://localhost:8069")
    pub url: String,
    /// Database display name, used as the artifact filename prefix
    pub db: String,
    /// API username (part of the configured identity, unused by the backup call)
    #[serde(default)]
    pub username: String,
    /// API password (part of the configured identity, unused by the backup call)
    #[serde(default)]
    pub password: String,
    /// Master/admin password required by the database manager
    pub master_password: String,
    /// Name of the database to export
    pub database_name: String,
}

/// Backup policy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Local output directory
    pub backup_dir: PathBuf,
    /// Retention window in days
    pub keep_days: u32,
    /// Export format tag sent to the backup endpoint
    pub backup_format: BackupFormat,
    /// Prune aged-out artifacts even when their upload was never confirmed
    #[serde(default)]
    pub prune_unconfirmed: bool,
}

/// Export format understood by Odoo's database manager
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    /// Zip archive with SQL dump and filestore
    #[default]
    Zip,
    /// pg_dump custom format, without filestore
    Dump,
}

impl BackupFormat {
    /// Tag sent verbatim as `backup_format`
    pub fn tag(&self) -> &'static str {
        match self {
            BackupFormat::Zip => "zip",
            BackupFormat::Dump => "dump",
        }
    }

    /// File extension of the local artifact
    pub fn extension(&self) -> &'static str {
        self.tag()
    }
}

/// Google Drive configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleDriveConfig {
    /// OAuth client secrets descriptor (client_secrets.json)
    pub credentials_file: PathBuf,
    /// Persisted session record, read and rewritten every run
    pub token_store: PathBuf,
    /// Optional parent folder for uploaded artifacts
    pub folder_id: Option<String>,
    /// Media upload endpoint
    pub upload_url: String,
    /// OAuth scope requested during authorization
    pub scope: String,
    /// How long the interactive flow waits for the browser callback
    pub authorization_timeout_seconds: u64,
    /// Loopback port for the OAuth redirect (0 = ephemeral)
    pub redirect_port: u16,
}

/// Network timeouts
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub connect_timeout_seconds: u64,
    /// Whole-request timeout for the export call
    pub export_timeout_seconds: u64,
    /// Whole-request timeout for the upload call
    pub upload_timeout_seconds: u64,
    /// Whole-request timeout for token exchange and refresh
    pub auth_timeout_seconds: u64,
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_seconds)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_seconds)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_seconds)
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsConfig {
    /// Write the Prometheus text exposition here after each run
    pub textfile_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. The given configuration file (format detected by extension)
    /// 3. Environment variables (ODOO_BACKUP__*)
    ///
    /// # Errors
    /// `ConfigMissing` if the file does not exist, `Config` if it is invalid
    pub fn load(path: &Path) -> Result<Self, AppError> {
        use config::{Config, Environment, File};

        if !path.is_file() {
            return Err(AppError::ConfigMissing(path.to_path_buf()));
        }

        let config = Config::builder()
            .set_default("backup.backup_dir", "backups")?
            .set_default("backup.keep_days", 7)?
            .set_default("backup.backup_format", "zip")?
            .set_default("backup.prune_unconfirmed", false)?
            .set_default("google_drive.credentials_file", "client_secrets.json")?
            .set_default("google_drive.token_store", "credentials.json")?
            .set_default(
                "google_drive.upload_url",
                "https://www.googleapis.com/upload/drive/v3/files",
            )?
            .set_default(
                "google_drive.scope",
                "https://www.googleapis.com/auth/drive.file",
            )?
            .set_default("google_drive.authorization_timeout_seconds", 300)?
            .set_default("google_drive.redirect_port", 0)?
            .set_default("http.connect_timeout_seconds", 30)?
            .set_default("http.export_timeout_seconds", 3600)?
            .set_default("http.upload_timeout_seconds", 3600)?
            .set_default("http.auth_timeout_seconds", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix("ODOO_BACKUP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Backup endpoint of the configured Odoo server
    pub fn backup_endpoint(&self) -> String {
        format!("{}/web/database/backup", self.odoo.url.trim_end_matches('/'))
    }

    fn validate(&self) -> Result<(), AppError> {
        let url = url::Url::parse(&self.odoo.url)
            .map_err(|e| AppError::Config(format!("odoo.url is not a valid URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::Config(
                "odoo.url must use http or https".to_string(),
            ));
        }

        for (key, value) in [
            ("odoo.db", &self.odoo.db),
            ("odoo.database_name", &self.odoo.database_name),
            ("odoo.master_password", &self.odoo.master_password),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::Config(format!("{} must not be empty", key)));
            }
        }

        for (key, value) in [
            ("http.connect_timeout_seconds", self.http.connect_timeout_seconds),
            ("http.export_timeout_seconds", self.http.export_timeout_seconds),
            ("http.upload_timeout_seconds", self.http.upload_timeout_seconds),
            ("http.auth_timeout_seconds", self.http.auth_timeout_seconds),
            (
                "google_drive.authorization_timeout_seconds",
                self.google_drive.authorization_timeout_seconds,
            ),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!(
                    "{} must be greater than 0",
                    key
                )));
            }
        }

        if self.odoo.username.is_empty() {
            tracing::debug!("odoo.username is not set; the backup call does not need it");
        }

        Ok(())
    }
}
