//! Per-request authentication context.

use http::HeaderValue;
use vestibule_auth::{Claims, Credentials};

use crate::flow::Flow;
use crate::request::ContentType;

/// State accumulated while one request is evaluated.
///
/// A context is created for every inbound request, owned by that request's
/// task, and handed to the response dispatcher at the end.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Correlation id.
    pub request_id: String,
    /// Response encoding preferred by the client.
    pub content_type: ContentType,
    /// The caller holds a valid session or has just authenticated.
    pub authenticated: bool,
    /// The caller reached the login flow with a valid session token.
    pub authorized: bool,
    /// At least one backend matched the submitted credentials' realm.
    pub auth_backend_found: bool,
    /// Credentials were submitted.
    pub auth_credentials_found: bool,
    /// Active flow.
    pub flow: Option<Flow>,
    /// Submitted credentials.
    pub credentials: Option<Credentials>,
    /// Claims of the validated token or of the backend that authenticated the caller.
    pub claims: Option<Claims>,
    /// Status code to render.
    pub status_code: Option<u16>,
    /// User-facing message.
    pub message: Option<String>,
    pub(crate) set_cookies: Vec<HeaderValue>,
}

impl AuthRequest {
    /// Creates an unauthenticated context.
    pub fn new(request_id: impl Into<String>, content_type: ContentType) -> Self {
        Self {
            request_id: request_id.into(),
            content_type,
            authenticated: false,
            authorized: false,
            auth_backend_found: false,
            auth_credentials_found: false,
            flow: None,
            credentials: None,
            claims: None,
            status_code: None,
            message: None,
            set_cookies: Vec::new(),
        }
    }

    /// Queues a `Set-Cookie` value for the final response.
    pub fn set_cookie(&mut self, cookie: HeaderValue) {
        self.set_cookies.push(cookie);
    }

    /// Cookies queued for the final response.
    pub fn pending_cookies(&self) -> &[HeaderValue] {
        &self.set_cookies
    }

    /// Records a failed authentication attempt.
    ///
    /// Identity established earlier in the request is kept.
    pub(crate) fn fail(&mut self, status_code: u16) {
        self.message = Some("Authentication failed".to_string());
        self.status_code = Some(status_code);
    }
}
