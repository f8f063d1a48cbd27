//! Short-lived consent tokens.
//!
//! A consent token binds one consent session to the local OS user. It is
//! handed to the consent UI as a query parameter and lets that UI call the
//! login-guarded endpoints for the same user until it expires. Tokens are
//! signed with a per-process secret, so a daemon restart invalidates every
//! outstanding token.
//!
//! Wire format: `base64url(claims_json) "." base64url(hmac_sha256(claims_json))`.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::digest::Key;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SECRET_LEN: usize = 64;

/// Default lifetime of a consent token.
pub const CONSENT_TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

/// Errors returned when a token fails verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// The token is not `payload.signature`.
    #[error("malformed token")]
    Malformed,

    /// The signature does not match the payload.
    #[error("invalid token signature")]
    BadSignature,

    /// The token is past its expiry.
    #[error("token expired")]
    Expired,
}

/// Claims carried by a consent token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentClaims {
    /// Consent session the token was issued for.
    pub session: String,
    /// Local OS username the token is bound to.
    pub user: String,
    /// Expiry as Unix seconds.
    pub exp: i64,
}

/// Issues and verifies consent tokens with an in-memory secret.
#[derive(Clone)]
pub struct ConsentTokenSigner {
    secret: [u8; SECRET_LEN],
}

impl std::fmt::Debug for ConsentTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentTokenSigner").finish_non_exhaustive()
    }
}

impl ConsentTokenSigner {
    /// Creates a signer with a fresh random secret.
    pub fn new() -> Self {
        let mut secret = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    /// Issues a token for `session` bound to `user`, valid for `ttl`.
    pub fn issue(&self, session: &str, user: &str, ttl: Duration) -> String {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = ConsentClaims {
            session: session.to_string(),
            user: user.to_string(),
            exp: Utc::now().timestamp().saturating_add(ttl_secs),
        };

        // Serializing a struct of strings and an integer cannot fail.
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let signature = self.sign(&payload);

        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    /// Verifies a token and returns its claims.
    pub fn verify(&self, token: &str) -> Result<ConsentClaims, TokenError> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac();
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: ConsentClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

        if claims.exp < Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    fn mac(&self) -> HmacSha256 {
        // The secret is exactly one SHA-256 block, the native HMAC key size.
        <HmacSha256 as Mac>::new(Key::<HmacSha256>::from_slice(&self.secret))
    }
}

impl Default for ConsentTokenSigner {
    fn default() -> Self {
        Self::new()
    }
}
