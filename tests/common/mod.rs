//! Common test utilities for E2E tests
//!
//! `TestServer` plays every remote party at once: the Odoo database
//! manager, Google's token endpoint and the Drive upload endpoint.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use axum::{
    Form, Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use chrono::Utc;
use odoo_backup::auth::{AuthSession, ConsentPrompt, CredentialStore};
use odoo_backup::config;
use odoo_backup::error::AppError;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Canned responses of the mock endpoints
#[derive(Debug, Clone)]
pub struct Behavior {
    pub export_status: StatusCode,
    pub export_body: Vec<u8>,
    pub token_status: StatusCode,
    pub upload_status: StatusCode,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            export_status: StatusCode::OK,
            export_body: b"PK\x03\x04 odoo backup archive".to_vec(),
            token_status: StatusCode::OK,
            upload_status: StatusCode::OK,
        }
    }
}

/// Everything the mock endpoints observed
#[derive(Default)]
pub struct Recorded {
    pub export_calls: AtomicUsize,
    pub token_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub export_forms: Mutex<Vec<HashMap<String, String>>>,
    pub token_grants: Mutex<Vec<String>>,
    pub upload_bodies: Mutex<Vec<Vec<u8>>>,
    pub upload_auth: Mutex<Vec<String>>,
    pub upload_queries: Mutex<Vec<HashMap<String, String>>>,
}

#[derive(Clone)]
struct MockState {
    behavior: Arc<Behavior>,
    recorded: Arc<Recorded>,
}

/// Test environment: mock server, scratch directory and matching config
pub struct TestServer {
    pub addr: String,
    pub recorded: Arc<Recorded>,
    pub config: config::AppConfig,
    pub _temp_dir: TempDir,
}

impl TestServer {
    /// Create a new test environment with default endpoint behavior
    pub async fn new() -> Self {
        Self::with_behavior(Behavior::default()).await
    }

    pub async fn with_behavior(behavior: Behavior) -> Self {
        let recorded = Arc::new(Recorded::default());
        let state = MockState {
            behavior: Arc::new(behavior),
            recorded: recorded.clone(),
        };

        let app = Router::new()
            .route("/web/database/backup", post(database_backup))
            .route("/token", post(token))
            .route("/upload", post(upload))
            .with_state(state);

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let temp_dir = TempDir::new().unwrap();
        let credentials_file = temp_dir.path().join("client_secrets.json");
        std::fs::write(
            &credentials_file,
            serde_json::json!({
                "installed": {
                    "client_id": "test-client-id",
                    "client_secret": "test-client-secret",
                    "auth_uri": format!("{}/auth", addr),
                    "token_uri": format!("{}/token", addr),
                    "redirect_uris": ["http://localhost"]
                }
            })
            .to_string(),
        )
        .unwrap();

        let config = test_config(temp_dir.path(), &addr, credentials_file);

        Self {
            addr,
            recorded,
            config,
            _temp_dir: temp_dir,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.config.backup.backup_dir
    }

    pub fn token_store(&self) -> CredentialStore {
        CredentialStore::new(self.config.google_drive.token_store.clone())
    }

    /// Store a session that is valid for another hour
    pub async fn store_valid_session(&self) -> AuthSession {
        self.store_session(Utc::now() + chrono::Duration::hours(1)).await
    }

    /// Store a session whose access token already expired
    pub async fn store_expired_session(&self) -> AuthSession {
        self.store_session(Utc::now() - chrono::Duration::hours(1)).await
    }

    async fn store_session(&self, expires_at: chrono::DateTime<Utc>) -> AuthSession {
        let session = AuthSession {
            access_token: "stored-access-token".to_string(),
            refresh_token: Some("stored-refresh-token".to_string()),
            token_type: "Bearer".to_string(),
            scope: Some("https://www.googleapis.com/auth/drive.file".to_string()),
            expires_at,
        };
        self.token_store().save(&session).await.unwrap();
        session
    }

    /// Create a file in the backup directory aged `age`
    pub fn backup_file_aged(&self, name: &str, age: Duration) -> PathBuf {
        std::fs::create_dir_all(self.backup_dir()).unwrap();
        let path = self.backup_dir().join(name);
        std::fs::write(&path, b"old backup").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
        path
    }

    /// Sorted file names in the backup directory (empty if it does not exist)
    pub fn backup_listing(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.backup_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn export_calls(&self) -> usize {
        self.recorded.export_calls.load(Ordering::SeqCst)
    }

    pub fn token_calls(&self) -> usize {
        self.recorded.token_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.recorded.upload_calls.load(Ordering::SeqCst)
    }
}

fn test_config(root: &Path, addr: &str, credentials_file: PathBuf) -> config::AppConfig {
    config::AppConfig {
        odoo: config::OdooConfig {
            url: addr.to_string(),
            db: "mydb".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            master_password: "master-secret".to_string(),
            database_name: "mydb_prod".to_string(),
        },
        backup: config::BackupConfig {
            backup_dir: root.join("backups"),
            keep_days: 7,
            backup_format: config::BackupFormat::Zip,
            prune_unconfirmed: false,
        },
        google_drive: config::GoogleDriveConfig {
            credentials_file,
            token_store: root.join("credentials.json"),
            folder_id: Some("backup-folder".to_string()),
            upload_url: format!("{}/upload", addr),
            scope: "https://www.googleapis.com/auth/drive.file".to_string(),
            authorization_timeout_seconds: 10,
            redirect_port: 0,
        },
        http: config::HttpConfig {
            connect_timeout_seconds: 5,
            export_timeout_seconds: 10,
            upload_timeout_seconds: 10,
            auth_timeout_seconds: 10,
        },
        metrics: config::MetricsConfig {
            textfile_path: Some(root.join("odoo_backup.prom")),
        },
        logging: config::LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

async fn database_backup(
    State(state): State<MockState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.recorded.export_calls.fetch_add(1, Ordering::SeqCst);
    state.recorded.export_forms.lock().unwrap().push(form);

    let behavior = &state.behavior;
    if behavior.export_status == StatusCode::OK {
        (StatusCode::OK, behavior.export_body.clone()).into_response()
    } else {
        (
            behavior.export_status,
            String::from_utf8_lossy(&behavior.export_body).into_owned(),
        )
            .into_response()
    }
}

async fn token(
    State(state): State<MockState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let call = state.recorded.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    let grant_type = form.get("grant_type").cloned().unwrap_or_default();
    state.recorded.token_grants.lock().unwrap().push(grant_type.clone());

    if state.behavior.token_status != StatusCode::OK {
        return (
            state.behavior.token_status,
            Json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })),
        )
            .into_response();
    }

    let mut body = serde_json::json!({
        "access_token": format!("issued-access-token-{}", call),
        "expires_in": 3599,
        "scope": "https://www.googleapis.com/auth/drive.file",
        "token_type": "Bearer"
    });
    if grant_type == "authorization_code" {
        body["refresh_token"] = serde_json::json!("issued-refresh-token");
    }
    Json(body).into_response()
}

async fn upload(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.recorded.upload_calls.fetch_add(1, Ordering::SeqCst);
    state.recorded.upload_queries.lock().unwrap().push(query);
    state.recorded.upload_bodies.lock().unwrap().push(body.to_vec());
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.recorded.upload_auth.lock().unwrap().push(auth);

    if state.behavior.upload_status != StatusCode::OK {
        return (
            state.behavior.upload_status,
            Json(serde_json::json!({
                "error": { "code": 403, "message": "The user's Drive storage quota has been exceeded." }
            })),
        )
            .into_response();
    }

    Json(serde_json::json!({ "id": "drive-file-1" })).into_response()
}

/// Plays the operator's browser: follows the consent URL straight to the
/// loopback redirect with a fixed authorization code.
#[derive(Clone, Default)]
pub struct BrowserSimulator {
    pub calls: Arc<AtomicUsize>,
    /// Send `error=access_denied` instead of a code
    pub deny: bool,
}

impl BrowserSimulator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConsentPrompt for BrowserSimulator {
    fn present(&self, url: &url::Url) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let redirect_uri = params["redirect_uri"].clone();
        let state = params["state"].clone();
        let outcome = if self.deny {
            "error=access_denied".to_string()
        } else {
            "code=test-authorization-code".to_string()
        };

        tokio::spawn(async move {
            let callback = format!("{}?{}&state={}", redirect_uri, outcome, state);
            let _ = reqwest::get(callback).await;
        });
        Ok(())
    }
}
