//! Session management
//!
//! The session record is a small JSON file (the credential store) that is
//! loaded at the start of each run, refreshed when expired, and written
//! back afterwards. The interactive authorization flow only runs when the
//! caller explicitly allows it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::oauth::{ClientSecrets, ConsentPrompt, OAuthClient, TerminalPrompt};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::storage::build_http_client;

/// Tokens are treated as expired this long before they actually expire
const EXPIRY_SKEW_SECONDS: i64 = 60;

/// Authorized handle to Google Drive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthSession {
    /// Bearer token for API calls
    pub access_token: String,
    /// Long-lived token used to obtain new access tokens
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scope: Option<String>,
    /// When the access token expires
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    /// Check if the access token is expired (or about to be)
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - chrono::Duration::seconds(EXPIRY_SKEW_SECONDS) <= now
    }
}

/// Whether `ensure_session` may fall back to the interactive flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Fail fast when no credential is stored (scheduled runs)
    Unattended,
    /// Run the authorization flow when no credential is stored
    Interactive,
}

/// Persisted session record on local disk
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored session, `None` if nothing is stored yet
    ///
    /// # Errors
    /// `AuthFlow` if the record exists but cannot be read or parsed
    pub async fn load(&self) -> Result<Option<AuthSession>, AppError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AppError::AuthFlow(format!(
                    "Failed to read credential store {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            AppError::AuthFlow(format!(
                "Corrupt credential store {} ({}); run `odoo-backup authorize`",
                self.path.display(),
                e
            ))
        })
    }

    /// Persist the session, replacing the previous record atomically
    ///
    /// The temporary file is created owner-readable only and keeps that
    /// mode after the rename.
    pub async fn save(&self, session: &AuthSession) -> Result<(), AppError> {
        let path = self.path.clone();
        let body = serde_json::to_vec_pretty(session).map_err(|e| AppError::Internal(e.into()))?;

        tokio::task::spawn_blocking(move || {
            use std::io::Write;

            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let mut file = tempfile::NamedTempFile::new_in(&dir)?;
            file.write_all(&body)?;
            file.as_file().sync_all()?;
            file.persist(&path).map_err(|e| e.error)?;
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(|e| {
            AppError::AuthFlow(format!(
                "Failed to write credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Establishes the one Google Drive session used by a run
pub struct SessionManager<P = TerminalPrompt> {
    store: CredentialStore,
    oauth: OAuthClient,
    prompt: P,
    redirect_port: u16,
    authorization_timeout: Duration,
}

impl<P: ConsentPrompt> SessionManager<P> {
    /// Create a session manager that presents consent URLs through `prompt`
    ///
    /// # Errors
    /// `Config` if the client secrets descriptor cannot be loaded
    pub fn with_prompt(config: &AppConfig, prompt: P) -> Result<Self, AppError> {
        let drive = &config.google_drive;
        let secrets = ClientSecrets::load(&drive.credentials_file)?;
        let http = build_http_client(config.http.connect_timeout(), config.http.auth_timeout())?;

        Ok(Self {
            store: CredentialStore::new(drive.token_store.clone()),
            oauth: OAuthClient::new(http, secrets, drive.scope.clone()),
            prompt,
            redirect_port: drive.redirect_port,
            authorization_timeout: Duration::from_secs(drive.authorization_timeout_seconds),
        })
    }

    /// Load, refresh or (in interactive mode) obtain the session
    ///
    /// # Steps
    /// 1. Load the stored record
    /// 2. Absent: fail (`Unattended`) or run the authorization flow (`Interactive`)
    /// 3. Expired: refresh
    /// 4. Persist the record, even when unchanged
    pub async fn ensure_session(&self, mode: SessionMode) -> Result<AuthSession, AppError> {
        let session = match self.store.load().await? {
            None => match mode {
                SessionMode::Unattended => {
                    return Err(AppError::AuthorizationRequired(
                        self.store.path().to_path_buf(),
                    ));
                }
                SessionMode::Interactive => {
                    tracing::info!("No stored credential; starting authorization flow");
                    self.run_authorization_flow().await?
                }
            },
            Some(session) if session.is_expired() => {
                tracing::info!(expired_at = %session.expires_at, "Refreshing Google Drive access token");
                self.oauth.refresh(&session).await?
            }
            Some(session) => {
                tracing::debug!(expires_at = %session.expires_at, "Stored access token is valid");
                session
            }
        };

        self.store.save(&session).await?;
        Ok(session)
    }

    /// Run the authorization flow unconditionally and persist the result
    ///
    /// Used by the one-time bootstrap command, and to recover from a
    /// revoked refresh token.
    pub async fn authorize(&self) -> Result<AuthSession, AppError> {
        let session = self.run_authorization_flow().await?;
        self.store.save(&session).await?;
        tracing::info!(path = %self.store.path().display(), "Credential stored");
        Ok(session)
    }

    async fn run_authorization_flow(&self) -> Result<AuthSession, AppError> {
        self.oauth
            .authorize(&self.prompt, self.redirect_port, self.authorization_timeout)
            .await
    }
}
