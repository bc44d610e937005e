//! Authorization codes (PKCE)
//!
//! One-time artifacts minted during `/authorize` and exchanged at the token
//! endpoint. Only the SHA-256 hash of a code is ever stored; consumption is
//! atomic so a code can never be exchanged twice.

use crate::agent::{hash_secret, random_secret};
use crate::error::{AuthError, Result};
use crate::store::{AuthCodeStore, CodeConsumeOutcome};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Default authorization-code lifetime
pub const DEFAULT_CODE_LIFETIME_SECS: i64 = 600;

/// PKCE challenge method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PkceMethod {
    /// `base64url(sha256(verifier)) == challenge`
    S256,
    /// `verifier == challenge`; permitted but discouraged
    Plain,
}

impl FromStr for PkceMethod {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "S256" => Ok(PkceMethod::S256),
            "plain" => Ok(PkceMethod::Plain),
            other => Err(AuthError::InvalidRequest(format!(
                "unsupported code_challenge_method '{}'",
                other
            ))),
        }
    }
}

/// Stored authorization-code row; the plaintext code never persists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    /// SHA-256 hash of the plaintext code
    pub code_hash: String,

    /// Client the code was minted for
    pub client_id: String,

    /// Redirect URI bound at `/authorize`
    pub redirect_uri: String,

    /// Space-delimited requested scope
    pub scope: String,

    /// PKCE challenge
    pub code_challenge: String,

    /// PKCE challenge method
    pub challenge_method: PkceMethod,

    /// Issuance timestamp
    pub issued_at: DateTime<Utc>,

    /// Expiry timestamp
    pub expires_at: DateTime<Utc>,

    /// Consumption timestamp; a consumed code is dead
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,

    /// Revocation flag, set when an exchange attempt fails verification
    pub revoked: bool,
}

impl AuthorizationCode {
    /// True when the code is past its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Verify a PKCE verifier against a stored challenge
pub fn verify_pkce(challenge: &str, method: PkceMethod, verifier: &str) -> Result<()> {
    let derived = match method {
        PkceMethod::S256 => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
        PkceMethod::Plain => verifier.to_string(),
    };

    let matches: bool = derived.as_bytes().ct_eq(challenge.as_bytes()).into();
    if matches {
        Ok(())
    } else {
        Err(AuthError::InvalidGrant("PKCE verification failed".into()))
    }
}

/// Authorization code service
///
/// Mints codes and performs the atomic verify-and-consume exchange step.
pub struct AuthCodeService {
    store: Arc<dyn AuthCodeStore>,
    lifetime: Duration,
}

impl AuthCodeService {
    /// Create a service with the default 600 s code lifetime
    pub fn new(store: Arc<dyn AuthCodeStore>) -> Self {
        Self {
            store,
            lifetime: Duration::seconds(DEFAULT_CODE_LIFETIME_SECS),
        }
    }

    /// Override the code lifetime
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Mint a new code; returns the plaintext exactly once
    pub async fn create(
        &self,
        client_id: &str,
        redirect_uri: &str,
        scope: &str,
        code_challenge: &str,
        challenge_method: PkceMethod,
    ) -> Result<String> {
        if code_challenge.is_empty() {
            return Err(AuthError::InvalidRequest("code_challenge required".into()));
        }

        let plaintext = random_secret();
        let now = Utc::now();
        let code = AuthorizationCode {
            code_hash: hash_secret(&plaintext),
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            scope: scope.to_string(),
            code_challenge: code_challenge.to_string(),
            challenge_method,
            issued_at: now,
            expires_at: now + self.lifetime,
            used_at: None,
            revoked: false,
        };

        self.store.insert(code).await?;
        debug!(client_id, "authorization code minted");
        Ok(plaintext)
    }

    /// Atomically verify and consume a code.
    ///
    /// Exactly one of two concurrent exchanges of the same code succeeds;
    /// the loser sees `invalid_grant`. Any verification failure after the
    /// code has been claimed burns it, so a code never survives a failed
    /// exchange attempt.
    pub async fn verify_and_consume(
        &self,
        code_plain: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<AuthorizationCode> {
        let code_hash = hash_secret(code_plain);

        let code = match self.store.consume(&code_hash, Utc::now()).await? {
            CodeConsumeOutcome::Consumed(code) => code,
            CodeConsumeOutcome::NotFound => {
                return Err(AuthError::InvalidGrant("authorization code not found".into()))
            }
            CodeConsumeOutcome::AlreadyUsed => {
                return Err(AuthError::InvalidGrant("code already used".into()))
            }
            CodeConsumeOutcome::Revoked => {
                return Err(AuthError::InvalidGrant("code revoked".into()))
            }
            CodeConsumeOutcome::Expired => {
                return Err(AuthError::InvalidGrant("code expired".into()))
            }
        };

        if code.client_id != client_id {
            self.store.revoke(&code_hash).await?;
            return Err(AuthError::InvalidGrant("client mismatch".into()));
        }

        if code.redirect_uri != redirect_uri {
            self.store.revoke(&code_hash).await?;
            return Err(AuthError::InvalidGrant("redirect_uri mismatch".into()));
        }

        if let Err(err) = verify_pkce(&code.code_challenge, code.challenge_method, code_verifier) {
            self.store.revoke(&code_hash).await?;
            return Err(err);
        }

        Ok(code)
    }
}
