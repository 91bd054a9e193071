//! Authentication backend trait.

use std::collections::HashMap;

use async_trait::async_trait;
use http::HeaderMap;

use crate::{AuthError, AuthMethod, BackendIdentity, Claims, Credentials};

/// Everything a backend may inspect while authenticating one request.
#[derive(Debug, Clone, Copy)]
pub struct AuthAttempt<'a> {
    /// Correlation id of the request.
    pub request_id: &'a str,
    /// Scheme and authority the request was received on, e.g. `https://auth.example.com`.
    pub base_url: &'a str,
    /// Portal path of the backend endpoint, e.g. `/auth/oauth2/google`.
    pub request_path: &'a str,
    /// Decoded query parameters (first value wins).
    pub query: &'a HashMap<String, String>,
    /// Request headers.
    pub headers: &'a HeaderMap,
    /// Credentials submitted to the login form, if any.
    pub credentials: Option<&'a Credentials>,
}

impl AuthAttempt<'_> {
    /// Absolute URL of the backend endpoint, used as a callback address.
    pub fn callback_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.request_path)
    }
}

/// Result of a backend's authentication step that did not fail outright.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// The subject is authenticated.
    Authenticated(Claims),
    /// The caller must continue at an external identity provider.
    Redirect(String),
    /// The backend finished without asserting an identity.
    Rejected {
        /// Status code to surface.
        code: u16,
    },
}

/// Trait for authentication backends.
///
/// A backend is addressed by its (method, realm) pair, which is unique within
/// one portal. Implementations are immutable once constructed and shared
/// across concurrent requests.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the operator-assigned name of this backend.
    fn name(&self) -> &str;

    /// Returns the realm this backend serves.
    fn realm(&self) -> &str;

    /// Returns the authentication method implemented by this backend.
    fn method(&self) -> AuthMethod;

    /// Authenticates the request.
    ///
    /// # Returns
    ///
    /// * `Ok(AuthOutcome)` - Claims, a redirect to an identity provider, or a rejection
    /// * `Err(AuthError)` - If authentication fails; [`AuthError::status_code`]
    ///   supplies the HTTP status surfaced to the caller
    async fn authenticate(&self, attempt: &AuthAttempt<'_>) -> Result<AuthOutcome, AuthError>;

    /// Returns the identity recorded alongside sessions this backend establishes.
    fn identity(&self) -> BackendIdentity {
        BackendIdentity {
            name: self.name().to_string(),
            realm: self.realm().to_string(),
            method: self.method(),
        }
    }
}
