//! odoo-backup - unattended Odoo database backup
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐    ┌───────────────┐    ┌────────────────────┐
//! │   Exporter    │ -> │   Uploader    │ -> │ Retention Manager  │
//! │ POST /web/... │    │ Google Drive  │    │ prune local files  │
//! └───────────────┘    └───────────────┘    └────────────────────┘
//!         ^                    ^
//!         │             ┌──────┴────────┐
//!   backup directory    │Session Manager│ <- credential store
//!                       └───────────────┘
//! ```
//!
//! One run exports exactly one artifact. The Drive session is resolved
//! before the export so an authorization problem is reported without
//! wasting an export. An export or authorization failure stops the run
//! before anything is uploaded or pruned; an upload failure keeps the
//! local artifact and skips pruning.
//!
//! At most one run may execute at a time; the credential store and the
//! backup directory are not locked.
//!
//! # Modules
//!
//! - `auth`: Google OAuth and the persisted session
//! - `storage`: export, upload and retention
//! - `config`: Configuration management
//! - `error`: Error types and exit codes
//! - `metrics`: Prometheus instruments

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;

use std::sync::Arc;

use crate::auth::{AuthSession, ConsentPrompt, SessionManager, SessionMode, TerminalPrompt};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::storage::{
    BackupArtifact, DriveUploader, Exporter, PruneReport, RetentionManager, UploadReceipt,
};

/// Outcome of a successful run
#[derive(Debug)]
pub struct RunSummary {
    pub artifact: BackupArtifact,
    pub receipt: UploadReceipt,
    pub prune: PruneReport,
}

/// One configured backup pipeline
///
/// Components are built once from the same immutable configuration and
/// reused for the whole run.
pub struct BackupRun<P = TerminalPrompt> {
    /// Application configuration
    pub config: Arc<AppConfig>,
    sessions: SessionManager<P>,
    exporter: Exporter,
    uploader: DriveUploader,
    retention: RetentionManager,
}

impl BackupRun<TerminalPrompt> {
    /// Build the pipeline
    ///
    /// # Errors
    /// Returns error if the client secrets cannot be loaded or an HTTP
    /// client cannot be built
    pub fn new(config: AppConfig) -> Result<Self, AppError> {
        Self::with_prompt(config, TerminalPrompt)
    }
}

impl<P: ConsentPrompt> BackupRun<P> {
    pub fn with_prompt(config: AppConfig, prompt: P) -> Result<Self, AppError> {
        tracing::debug!("Initializing backup pipeline...");

        let sessions = SessionManager::with_prompt(&config, prompt)?;
        let exporter = Exporter::new(&config)?;
        let uploader = DriveUploader::new(&config)?;
        let retention = RetentionManager::from_config(&config);

        Ok(Self {
            config: Arc::new(config),
            sessions,
            exporter,
            uploader,
            retention,
        })
    }

    /// Run the pipeline once and record its outcome in metrics
    pub async fn execute(&self, mode: SessionMode) -> Result<RunSummary, AppError> {
        let result = self.run_stages(mode).await;

        match &result {
            Ok(summary) => {
                metrics::RUNS_TOTAL.with_label_values(&["success"]).inc();
                metrics::LAST_SUCCESS_TIMESTAMP_SECONDS.set(chrono::Utc::now().timestamp() as f64);
                tracing::info!(
                    artifact = %summary.artifact.path.display(),
                    file_id = %summary.receipt.file_id,
                    pruned = summary.prune.removed_count(),
                    "Backup run completed"
                );
            }
            Err(error) => {
                metrics::RUNS_TOTAL.with_label_values(&[error.kind()]).inc();
                tracing::error!(error = %error, stage = error.kind(), "Backup run failed");
            }
        }

        if let Some(path) = &self.config.metrics.textfile_path {
            if let Err(error) = metrics::write_textfile(path) {
                tracing::warn!(error = %error, "Failed to write metrics textfile");
            }
        }

        result
    }

    async fn run_stages(&self, mode: SessionMode) -> Result<RunSummary, AppError> {
        let backup_dir = &self.config.backup.backup_dir;
        tokio::fs::create_dir_all(backup_dir).await.map_err(|e| {
            AppError::Storage(format!(
                "Failed to create backup directory {}: {}",
                backup_dir.display(),
                e
            ))
        })?;

        // 1. Session first, so an auth problem does not waste an export
        let session = self.establish_session(mode).await?;

        // 2. Export
        let artifact = {
            let _timer = metrics::STAGE_DURATION_SECONDS
                .with_label_values(&["export"])
                .start_timer();
            self.exporter.export(backup_dir).await?
        };
        if let Ok(size) = artifact.size().await {
            metrics::ARTIFACT_BYTES.set(size as f64);
        }

        // 3. Upload
        let receipt = self.upload(&session, &artifact).await?;
        if let Err(error) = artifact.mark_uploaded(&receipt).await {
            tracing::warn!(
                error = %error,
                "Upload succeeded but the marker was not written; retention will keep this artifact"
            );
        }

        // 4. Retention
        let prune = self.prune().await?;

        Ok(RunSummary {
            artifact,
            receipt,
            prune,
        })
    }

    async fn establish_session(&self, mode: SessionMode) -> Result<AuthSession, AppError> {
        let _timer = metrics::STAGE_DURATION_SECONDS
            .with_label_values(&["session"])
            .start_timer();
        self.sessions.ensure_session(mode).await
    }

    async fn upload(
        &self,
        session: &AuthSession,
        artifact: &BackupArtifact,
    ) -> Result<UploadReceipt, AppError> {
        let _timer = metrics::STAGE_DURATION_SECONDS
            .with_label_values(&["upload"])
            .start_timer();
        self.uploader.upload(session, artifact).await.inspect_err(|_| {
            tracing::warn!(
                path = %artifact.path.display(),
                "Local artifact kept after failed upload"
            );
        })
    }

    /// Run retention only
    pub async fn prune(&self) -> Result<PruneReport, AppError> {
        let _timer = metrics::STAGE_DURATION_SECONDS
            .with_label_values(&["prune"])
            .start_timer();
        let report = self.retention.prune().await?;
        metrics::PRUNED_FILES_TOTAL.inc_by(report.removed_count() as u64);
        metrics::PRUNE_FAILURES_TOTAL.inc_by(report.failures.len() as u64);
        Ok(report)
    }

    /// Run the interactive authorization flow and store the credential
    pub async fn authorize(&self) -> Result<AuthSession, AppError> {
        self.sessions.authorize().await
    }
}
