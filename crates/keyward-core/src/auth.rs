//! Local account authentication.
//!
//! The dashboard endpoints are protected by a single local account per OS
//! user. Passwords are hashed with Argon2 and logins produce in-memory
//! session tokens with a sliding timeout.
//!
//! A second kind of bearer is accepted: the consent token minted for a
//! pending grant (see [`crate::token`]). It authenticates as the local OS
//! user only, so the consent UI can act on the register request it was
//! opened for without a separate login.
//!
//! ```
//! use keyward_core::auth::AuthManager;
//!
//! let auth = AuthManager::new("alice");
//! let hash = auth.hash_password("secret123").unwrap();
//! assert!(auth.verify_password("secret123", &hash).unwrap());
//!
//! let session = auth.create_session("alice");
//! assert_eq!(auth.authenticate(session.as_str()).as_deref(), Some("alice"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::{ConsentTokenSigner, CONSENT_TOKEN_TTL};

/// Minimum password length requirement.
pub const MIN_PASSWORD_LENGTH: usize = 6;

/// Idle time after which a login session expires.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Environment variable overriding the local OS username.
pub const USER_ENV: &str = "KEYWARD_USER";

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("username cannot be empty")]
    UsernameEmpty,

    #[error("password must be at least {MIN_PASSWORD_LENGTH} characters")]
    PasswordTooShort,

    #[error("password cannot be empty")]
    PasswordEmpty,

    #[error("failed to hash password: {0}")]
    HashingFailed(String),

    /// The stored hash could not be parsed.
    #[error("failed to verify password: {0}")]
    VerificationFailed(String),

    #[error("authentication required")]
    AuthRequired,
}

/// Result type for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Opaque login session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(String);

impl SessionToken {
    /// Create a new random session token.
    pub fn new() -> Self {
        let salt = SaltString::generate(&mut OsRng);
        Self(salt.to_string())
    }

    /// Wrap a token received from a request.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct SessionData {
    username: String,
    last_used: Instant,
}

impl SessionData {
    fn is_expired(&self) -> bool {
        self.last_used.elapsed() > SESSION_TIMEOUT
    }
}

/// Active login sessions keyed by token.
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<SessionToken, SessionData>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for `username` and return its token.
    pub fn create_session(&self, username: &str) -> SessionToken {
        let token = SessionToken::new();
        let data = SessionData {
            username: username.to_string(),
            last_used: Instant::now(),
        };

        let mut sessions = self.sessions.write();
        sessions.insert(token.clone(), data);
        sessions.retain(|_, data| !data.is_expired());

        token
    }

    /// Look up a session, refreshing its expiry. Returns the session's user.
    pub fn validate_session(&self, token: &SessionToken) -> Option<String> {
        let mut sessions = self.sessions.write();

        let expired = match sessions.get_mut(token) {
            Some(data) if !data.is_expired() => {
                data.last_used = Instant::now();
                return Some(data.username.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            sessions.remove(token);
        }
        None
    }

    /// Invalidate (logout) a session. Returns whether it existed.
    pub fn invalidate_session(&self, token: &SessionToken) -> bool {
        self.sessions.write().remove(token).is_some()
    }

    /// Number of non-expired sessions.
    pub fn active_session_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|d| !d.is_expired())
            .count()
    }
}

/// Password hashing, login sessions, and consent-token bearers for the
/// local OS user.
#[derive(Debug, Clone)]
pub struct AuthManager {
    local_user: String,
    sessions: SessionManager,
    consent_tokens: ConsentTokenSigner,
}

impl AuthManager {
    /// Create a manager for `local_user` with a fresh consent-token secret.
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            sessions: SessionManager::new(),
            consent_tokens: ConsentTokenSigner::new(),
        }
    }

    /// The OS user this daemon serves.
    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Validate account credentials before they are stored.
    pub fn validate_credentials(username: &str, password: &str) -> Result<()> {
        if username.trim().is_empty() {
            return Err(AuthError::UsernameEmpty);
        }
        if password.is_empty() {
            return Err(AuthError::PasswordEmpty);
        }
        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(AuthError::PasswordTooShort);
        }
        Ok(())
    }

    /// Hash a password using Argon2, returning a PHC string.
    pub fn hash_password(&self, password: &str) -> Result<String> {
        if password.is_empty() {
            return Err(AuthError::PasswordEmpty);
        }
        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(AuthError::PasswordTooShort);
        }

        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::HashingFailed(e.to_string()))
    }

    /// Verify a password against a stored PHC hash.
    pub fn verify_password(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed_hash =
            PasswordHash::new(hash).map_err(|e| AuthError::VerificationFailed(e.to_string()))?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AuthError::VerificationFailed(e.to_string())),
        }
    }

    /// Start a login session. Call after the password has been verified.
    pub fn create_session(&self, username: &str) -> SessionToken {
        self.sessions.create_session(username)
    }

    pub fn logout(&self, token: &SessionToken) -> bool {
        self.sessions.invalidate_session(token)
    }

    /// Mint a consent token for a pending grant session.
    pub fn issue_consent_token(&self, consent_session: &str) -> String {
        self.consent_tokens
            .issue(consent_session, &self.local_user, CONSENT_TOKEN_TTL)
    }

    /// Whether `token` is an unexpired consent token minted for `session`
    /// and the local OS user.
    pub fn verify_consent_token(&self, token: &str, session: &str) -> bool {
        match self.consent_tokens.verify(token) {
            Ok(claims) => claims.session == session && claims.user == self.local_user,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected consent token");
                false
            }
        }
    }

    /// Resolve a bearer credential to a username.
    ///
    /// Accepts a live login session, or an unexpired consent token issued to
    /// the local OS user.
    pub fn authenticate(&self, bearer: &str) -> Option<String> {
        if bearer.is_empty() {
            return None;
        }

        if let Some(username) = self
            .sessions
            .validate_session(&SessionToken::from_string(bearer))
        {
            return Some(username);
        }

        match self.consent_tokens.verify(bearer) {
            Ok(claims) if claims.user == self.local_user => Some(claims.user),
            Ok(claims) => {
                tracing::debug!(user = %claims.user, "Consent token issued to a different user");
                None
            }
            Err(_) => None,
        }
    }

    /// Like [`authenticate`](Self::authenticate) but returns an error.
    pub fn require(&self, bearer: &str) -> Result<String> {
        self.authenticate(bearer).ok_or(AuthError::AuthRequired)
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.active_session_count()
    }
}

/// Name of the OS user running the daemon.
///
/// `KEYWARD_USER` wins, then the platform's user variables.
pub fn local_username() -> String {
    [USER_ENV, "USER", "USERNAME", "LOGNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| "user".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_credential_validation() {
        assert!(AuthManager::validate_credentials("alice", "123456").is_ok());
        assert!(matches!(
            AuthManager::validate_credentials("  ", "123456"),
            Err(AuthError::UsernameEmpty)
        ));
        assert!(matches!(
            AuthManager::validate_credentials("alice", ""),
            Err(AuthError::PasswordEmpty)
        ));
        assert!(matches!(
            AuthManager::validate_credentials("alice", "12345"),
            Err(AuthError::PasswordTooShort)
        ));
    }

    #[test]
    fn test_hash_and_verify() {
        let auth = AuthManager::new("alice");
        let hash = auth.hash_password("password123").unwrap();

        assert!(hash.starts_with("$argon2"));
        assert!(auth.verify_password("password123", &hash).unwrap());
        assert!(!auth.verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn test_hash_password_unique_salts() {
        let auth = AuthManager::new("alice");
        let hash1 = auth.hash_password("password123").unwrap();
        let hash2 = auth.hash_password("password123").unwrap();
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_verify_password_invalid_hash() {
        let auth = AuthManager::new("alice");
        let err = auth.verify_password("password", "not_a_valid_hash").unwrap_err();
        assert!(matches!(err, AuthError::VerificationFailed(_)));
    }

    #[test]
    fn test_session_resolves_username() {
        let auth = AuthManager::new("alice");
        let token = auth.create_session("alice");

        assert_eq!(auth.authenticate(token.as_str()).as_deref(), Some("alice"));
        assert_eq!(auth.active_session_count(), 1);
    }

    #[test]
    fn test_logout_invalidates_session() {
        let auth = AuthManager::new("alice");
        let token = auth.create_session("alice");

        assert!(auth.logout(&token));
        assert!(auth.authenticate(token.as_str()).is_none());
        assert!(!auth.logout(&token));
    }

    #[test]
    fn test_unknown_bearer_rejected() {
        let auth = AuthManager::new("alice");
        assert!(auth.authenticate("").is_none());
        assert!(auth.authenticate("not-a-token").is_none());
        assert!(matches!(auth.require("nope"), Err(AuthError::AuthRequired)));
    }

    #[test]
    fn test_consent_token_authenticates_local_user() {
        let auth = AuthManager::new("alice");
        let token = auth.issue_consent_token("session-1");

        assert_eq!(auth.authenticate(&token).as_deref(), Some("alice"));
    }

    #[test]
    fn test_consent_token_from_other_daemon_rejected() {
        let auth = AuthManager::new("alice");
        let other = AuthManager::new("alice");
        let token = other.issue_consent_token("session-1");

        assert!(auth.authenticate(&token).is_none());
    }

    #[test]
    fn test_consent_token_for_other_user_rejected() {
        let auth = AuthManager::new("alice");
        let signer_for_bob = AuthManager {
            local_user: "bob".to_string(),
            sessions: SessionManager::new(),
            consent_tokens: auth.consent_tokens.clone(),
        };
        let token = signer_for_bob.issue_consent_token("session-1");

        assert!(auth.authenticate(&token).is_none());
    }

    #[test]
    fn test_consent_token_bound_to_session() {
        let auth = AuthManager::new("alice");
        let token = auth.issue_consent_token("session-1");

        assert!(auth.verify_consent_token(&token, "session-1"));
        assert!(!auth.verify_consent_token(&token, "session-2"));
        assert!(!auth.verify_consent_token("", "session-1"));

        let other = AuthManager::new("alice");
        assert!(!other.verify_consent_token(&token, "session-1"));
    }

    #[test]
    fn test_clones_share_sessions() {
        let auth = AuthManager::new("alice");
        let clone = auth.clone();
        let token = auth.create_session("alice");

        assert!(clone.authenticate(token.as_str()).is_some());
    }

    #[test]
    fn test_session_manager_thread_safe() {
        let auth = AuthManager::new("alice");

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let auth_clone = auth.clone();
                thread::spawn(move || {
                    let token = auth_clone.create_session("alice");
                    auth_clone.authenticate(token.as_str()).is_some()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }

        assert_eq!(auth.active_session_count(), 10);
    }

    #[test]
    fn test_local_username_not_empty() {
        assert!(!local_username().is_empty());
    }
}
