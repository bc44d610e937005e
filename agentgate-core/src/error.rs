//! Error types for the agentgate engine

/// Result type for agentgate operations
pub type Result<T> = std::result::Result<T, AuthError>;

/// Engine errors, aligned with the OAuth 2.1 wire error vocabulary
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Missing or malformed input
    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    /// Unknown, inactive, or unauthenticated client
    #[error("invalid_client: {0}")]
    InvalidClient(String),

    /// Grant artifact is unknown, used, revoked, expired, or mismatched
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    /// Requested scopes are malformed or exceed what the grant allows
    #[error("invalid_scope: {0}")]
    InvalidScope(String),

    /// Denied by the policy engine or by an authorization rule
    #[error("access_denied: {0}")]
    AccessDenied(String),

    /// Grant type not supported by the token endpoint
    #[error("unsupported_grant_type: {0}")]
    UnsupportedGrantType(String),

    /// Delegation chain would exceed the grant's maximum depth
    #[error("Delegation depth exceeded: {current} > {max}")]
    DelegationDepthExceeded {
        /// Depth the request would reach
        current: u32,
        /// Maximum depth the grant allows
        max: u32,
    },

    /// Signing key could not be loaded or used
    #[error("Signing key error: {0}")]
    SigningKey(String),

    /// Backing store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Policy engine transport or protocol failure
    #[error("Policy engine error: {0}")]
    Policy(String),

    /// Internal failure, never leaks internals to the wire
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// OAuth error code for the wire, per RFC 6749 §5.2
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidRequest(_) => "invalid_request",
            AuthError::InvalidClient(_) => "invalid_client",
            AuthError::InvalidGrant(_) => "invalid_grant",
            AuthError::InvalidScope(_) => "invalid_scope",
            AuthError::AccessDenied(_) => "access_denied",
            AuthError::UnsupportedGrantType(_) => "unsupported_grant_type",
            AuthError::DelegationDepthExceeded { .. } => "access_denied",
            AuthError::SigningKey(_)
            | AuthError::Store(_)
            | AuthError::Policy(_)
            | AuthError::Internal(_) => "server_error",
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::InvalidRequest(_) => 400,
            AuthError::InvalidClient(_) => 401,
            AuthError::InvalidGrant(_) => 400,
            AuthError::InvalidScope(_) => 400,
            AuthError::AccessDenied(_) => 403,
            AuthError::UnsupportedGrantType(_) => 400,
            AuthError::DelegationDepthExceeded { .. } => 403,
            AuthError::SigningKey(_) => 500,
            AuthError::Store(_) => 500,
            AuthError::Policy(_) => 502,
            AuthError::Internal(_) => 500,
        }
    }

    /// True when the failure is infrastructure rather than the caller's input
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

// Conversions from common error types
impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Internal(format!("JSON error: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AuthError::SigningKey(err.to_string())
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Policy(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AuthError {
    fn from(err: validator::ValidationErrors) -> Self {
        AuthError::InvalidRequest(err.to_string())
    }
}
