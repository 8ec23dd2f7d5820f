//! Google OAuth 2.0 for installed applications
//!
//! Implements the authorization code flow with a loopback redirect and the
//! refresh token grant.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    response::Html,
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use crate::auth::session::AuthSession;
use crate::error::AppError;

/// Token lifetime assumed when the provider omits `expires_in`
const DEFAULT_EXPIRES_IN_SECONDS: i64 = 3600;

/// How long the loopback server may take to drain after the callback
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// OAuth client registration, read from a Google client secrets file
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// client_secrets.json wraps the registration in `installed` or `web`
#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    /// Load a client secrets descriptor
    ///
    /// # Errors
    /// `Config` if the file is missing or is not a client secrets document
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read(path).map_err(|e| {
            AppError::Config(format!(
                "Failed to read Google client secrets {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&raw).map_err(|message| {
            AppError::Config(format!("{}: {}", path.display(), message))
        })
    }

    fn parse(raw: &[u8]) -> Result<Self, String> {
        let file: ClientSecretsFile =
            serde_json::from_slice(raw).map_err(|e| format!("invalid client secrets: {}", e))?;
        file.installed
            .or(file.web)
            .ok_or_else(|| "expected an `installed` or `web` client".to_string())
    }
}

/// Shows the consent URL to the operator
pub trait ConsentPrompt {
    fn present(&self, url: &Url) -> Result<(), AppError>;
}

/// Prints the consent URL on the terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl ConsentPrompt for TerminalPrompt {
    fn present(&self, url: &Url) -> Result<(), AppError> {
        println!("Open the following link in a browser to authorize Google Drive access:\n\n{url}\n");
        Ok(())
    }
}

/// Successful token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Token endpoint error body
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Query parameters of the loopback redirect
#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Clone)]
struct CallbackState {
    sender: Arc<Mutex<Option<oneshot::Sender<CallbackQuery>>>>,
}

/// OAuth client bound to one registration
pub struct OAuthClient {
    http: reqwest::Client,
    secrets: ClientSecrets,
    scope: String,
}

impl OAuthClient {
    pub fn new(http: reqwest::Client, secrets: ClientSecrets, scope: impl Into<String>) -> Self {
        Self {
            http,
            secrets,
            scope: scope.into(),
        }
    }

    /// Consent page URL for `redirect_uri`
    ///
    /// Requests offline access and forces the consent screen so Google
    /// returns a refresh token every time.
    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<Url, AppError> {
        Url::parse_with_params(
            &self.secrets.auth_uri,
            &[
                ("client_id", self.secrets.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", self.scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| AppError::Config(format!("Invalid auth_uri in client secrets: {}", e)))
    }

    /// Run the interactive authorization code flow
    ///
    /// Binds a loopback listener on `port` (0 = any), presents the consent
    /// URL, then waits at most `wait` for the browser redirect.
    ///
    /// # Errors
    /// `AuthFlow` on timeout, state mismatch, user denial or a rejected code
    pub async fn authorize<P: ConsentPrompt>(
        &self,
        prompt: &P,
        port: u16,
        wait: Duration,
    ) -> Result<AuthSession, AppError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| AppError::AuthFlow(format!("Failed to bind loopback listener: {}", e)))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| AppError::AuthFlow(e.to_string()))?
            .port();
        let redirect_uri = format!("http://127.0.0.1:{}/", local_port);

        let state = generate_csrf_state();
        let url = self.authorization_url(&redirect_uri, &state)?;

        tracing::info!(redirect_uri = %redirect_uri, "Waiting for authorization callback...");
        prompt.present(&url)?;

        let callback = receive_callback(listener, wait).await?;
        verify_csrf_state(&state, callback.state.as_deref())?;
        if let Some(error) = callback.error {
            return Err(AppError::AuthFlow(format!("Authorization denied: {}", error)));
        }
        let code = callback
            .code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| AppError::AuthFlow("Callback carried no authorization code".to_string()))?;

        self.exchange_code(&code, &redirect_uri).await
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<AuthSession, AppError> {
        let params = [
            ("code", code),
            ("client_id", self.secrets.client_id.as_str()),
            ("client_secret", self.secrets.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ];
        let token = self
            .request_token(&params)
            .await
            .map_err(AppError::AuthFlow)?;

        if token.refresh_token.is_none() {
            tracing::warn!("Token response has no refresh token; unattended runs will need re-authorization");
        }
        Ok(session_from_token(token, None))
    }

    /// Refresh an expired session
    ///
    /// Google usually omits the refresh token on refresh; the previous one
    /// is carried over.
    pub async fn refresh(&self, session: &AuthSession) -> Result<AuthSession, AppError> {
        let refresh_token = session.refresh_token.as_deref().ok_or_else(|| {
            AppError::AuthRefresh(
                "stored session has no refresh token; run `odoo-backup authorize`".to_string(),
            )
        })?;

        let params = [
            ("refresh_token", refresh_token),
            ("client_id", self.secrets.client_id.as_str()),
            ("client_secret", self.secrets.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let token = self
            .request_token(&params)
            .await
            .map_err(AppError::AuthRefresh)?;

        Ok(session_from_token(token, session.refresh_token.clone()))
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenResponse, String> {
        let response = self
            .http
            .post(&self.secrets.token_uri)
            .form(params)
            .send()
            .await
            .map_err(|e| format!("token request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(error) => match error.error_description {
                    Some(description) => format!("{}: {}", error.error, description),
                    None => error.error,
                },
                Err(_) => format!("token endpoint answered HTTP {}: {}", status.as_u16(), body),
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| format!("unexpected token response: {}", e))
    }
}

fn session_from_token(token: TokenResponse, previous_refresh_token: Option<String>) -> AuthSession {
    let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECONDS);
    AuthSession {
        access_token: token.access_token,
        refresh_token: token.refresh_token.or(previous_refresh_token),
        token_type: token.token_type,
        scope: token.scope,
        expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
    }
}

/// Serve the loopback redirect until one callback arrives or `wait` elapses
async fn receive_callback(listener: TcpListener, wait: Duration) -> Result<CallbackQuery, AppError> {
    let (sender, receiver) = oneshot::channel();
    let state = CallbackState {
        sender: Arc::new(Mutex::new(Some(sender))),
    };
    let app = Router::new()
        .route("/", get(oauth_callback))
        .with_state(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let outcome = tokio::time::timeout(wait, receiver).await;

    let _ = shutdown_tx.send(());
    stop_server(server, SHUTDOWN_GRACE).await;

    match outcome {
        Ok(Ok(callback)) => Ok(callback),
        Ok(Err(_)) => Err(AppError::AuthFlow(
            "Loopback server stopped before the callback arrived".to_string(),
        )),
        Err(_) => Err(AppError::AuthFlow(format!(
            "No authorization callback within {} seconds",
            wait.as_secs()
        ))),
    }
}

/// Wait up to `grace` for a shutting-down server task, then abort it
async fn stop_server<T>(mut server: JoinHandle<T>, grace: Duration) {
    if tokio::time::timeout(grace, &mut server).await.is_err() {
        tracing::debug!("Loopback server did not shut down in time, aborting it");
        server.abort();
    }
}

/// GET /
///
/// Hands the first callback carrying `state` or `error` to the waiting
/// flow. Requests with neither, and later hits, are ignored.
async fn oauth_callback(
    State(state): State<CallbackState>,
    Query(query): Query<CallbackQuery>,
) -> Html<&'static str> {
    if query.state.is_none() && query.error.is_none() {
        return Html("<p>Waiting for authorization.</p>");
    }

    let sender = state
        .sender
        .lock()
        .ok()
        .and_then(|mut guard| guard.take());
    if let Some(sender) = sender {
        let _ = sender.send(query);
    }

    Html(
        r#"
        <!DOCTYPE html>
        <html>
        <head><title>odoo-backup</title></head>
        <body>
            <p>Authorization received. You can close this window.</p>
        </body>
        </html>
    "#,
    )
}

/// Generate a random CSRF state token
fn generate_csrf_state() -> String {
    use base64::{Engine as _, engine::general_purpose};
    use rand::RngCore;

    let mut bytes = [0_u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Verify the callback state matches the one sent
fn verify_csrf_state(expected: &str, received: Option<&str>) -> Result<(), AppError> {
    match received {
        Some(state) if state == expected => Ok(()),
        _ => Err(AppError::AuthFlow(
            "State mismatch in authorization callback".to_string(),
        )),
    }
}
