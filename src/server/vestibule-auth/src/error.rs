//! Authentication error types.

use thiserror::Error;

/// Errors that can occur during authentication.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Invalid credentials (bad token, wrong password, etc.).
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Token has expired.
    #[error("token expired")]
    TokenExpired,

    /// No session token was presented.
    #[error("no token found")]
    MissingToken,

    /// Token is present but malformed or fails verification.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The request lacks something the backend needs to proceed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Identity provider returned an error or could not be reached.
    #[error("identity provider error: {0}")]
    Upstream(String),

    /// Authentication method not enabled.
    #[error("auth method not enabled: {0}")]
    MethodNotEnabled(String),

    /// Backend configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl AuthError {
    /// HTTP status code surfaced to the caller when a backend fails with this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidCredentials
            | Self::TokenExpired
            | Self::MissingToken
            | Self::InvalidToken(_) => 401,
            Self::MalformedRequest(_) => 400,
            Self::MethodNotEnabled(_) => 403,
            Self::Upstream(_) => 502,
            Self::Configuration(_) => 500,
        }
    }
}
