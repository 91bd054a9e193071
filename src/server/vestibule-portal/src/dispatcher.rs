//! Response dispatcher interface.
//!
//! The portal decides what happens to a request; a dispatcher turns that
//! decision into an HTTP response.

use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use http::request::Parts;

use crate::context::AuthRequest;
use crate::error::DispatchError;
use crate::portal::Portal;

/// Everything a renderer needs for one response.
pub struct Page<'a> {
    /// Portal serving the request, for its shared collaborators.
    pub portal: &'a Portal,
    /// Request line, headers and extensions.
    pub parts: &'a Parts,
    /// Unread request body. Empty unless the flow consumes a body.
    pub body: Body,
    /// Accumulated context.
    pub ctx: AuthRequest,
}

/// Renders the outcome chosen by the portal, one entry point per flow.
#[async_trait]
pub trait ResponseDispatcher: Send + Sync {
    /// Login form, or the post-login redirect when authenticated.
    async fn serve_login(&self, page: Page<'_>) -> Result<Response, DispatchError>;

    /// Generic page for errors and unsupported features.
    async fn serve_generic(&self, page: Page<'_>) -> Result<Response, DispatchError>;

    /// Registration form and submission.
    async fn serve_register(&self, page: Page<'_>) -> Result<Response, DispatchError>;

    /// Session termination.
    async fn serve_session_logoff(&self, page: Page<'_>) -> Result<Response, DispatchError>;

    /// Redirect to the login flow after the session token expired.
    async fn serve_session_login_redirect(&self, page: Page<'_>)
        -> Result<Response, DispatchError>;

    /// Static assets.
    async fn serve_static_assets(&self, page: Page<'_>) -> Result<Response, DispatchError>;

    /// Session introspection.
    async fn serve_whoami(&self, page: Page<'_>) -> Result<Response, DispatchError>;

    /// Account settings.
    async fn serve_settings(&self, page: Page<'_>) -> Result<Response, DispatchError>;

    /// Landing page.
    async fn serve_portal(&self, page: Page<'_>) -> Result<Response, DispatchError>;
}
