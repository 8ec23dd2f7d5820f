//! Google Drive authorization
//!
//! Handles:
//! - OAuth authorization code flow (one-time bootstrap)
//! - Token refresh
//! - Persisted session record

mod oauth;
pub mod session;

pub use oauth::{ClientSecrets, ConsentPrompt, OAuthClient, TerminalPrompt};
pub use session::{AuthSession, CredentialStore, SessionManager, SessionMode};
