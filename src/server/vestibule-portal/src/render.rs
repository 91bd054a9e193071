//! Default response dispatcher.
//!
//! Renders every flow as JSON. Browsers following the login flow get
//! redirects; API clients get the session token in the response body.

use std::time::{SystemTime, UNIX_EPOCH};

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use async_trait::async_trait;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{header, HeaderValue, Method, StatusCode};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use vestibule_storage::StorageError;

use crate::context::AuthRequest;
use crate::cookies::{redirect_target, REDIRECT_COOKIE};
use crate::dispatcher::{Page, ResponseDispatcher};
use crate::error::DispatchError;
use crate::flow::Flow;
use crate::portal::Portal;
use crate::request::ContentType;

/// Largest accepted registration body.
const MAX_REGISTRATION_BYTES: usize = 16 * 1024;

/// Shortest accepted registration password.
const MIN_PASSWORD_LEN: usize = 8;

/// JSON renderer used when a portal is not given its own dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDispatcher;

/// Registration submission.
#[derive(Debug, Deserialize)]
struct RegistrationForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default, deserialize_with = "checkbox")]
    accept_terms: bool,
}

/// Accepts JSON booleans as well as HTML checkbox values.
fn checkbox<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => b,
        Raw::Text(s) => matches!(s.as_str(), "on" | "true" | "yes" | "1"),
    })
}

/// Registration request as persisted in the registration store.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistrationRecord {
    /// Requested username.
    pub username: String,
    /// Contact email.
    pub email: String,
    /// Argon2id hash of the chosen password.
    pub password_hash: String,
    /// Unix time of the request.
    pub requested_at: u64,
    /// Correlation id of the submitting request.
    pub request_id: String,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Path of the portal's own login page.
fn login_path(portal: &Portal) -> String {
    portal.auth_url_path().to_string()
}

/// Default post-login landing page.
fn portal_path(portal: &Portal) -> String {
    format!("{}/portal", portal.auth_url_path().trim_end_matches('/'))
}

fn redirect(location: &str, cookies: Vec<HeaderValue>) -> Result<Response, DispatchError> {
    let mut builder = Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, HeaderValue::from_str(location)?);
    for cookie in cookies {
        builder = builder.header(header::SET_COOKIE, cookie);
    }
    Ok(builder.body(axum::body::Body::empty())?)
}

fn message_page(ctx: &AuthRequest, code: StatusCode, title: &str) -> Response {
    let message = ctx
        .message
        .clone()
        .unwrap_or_else(|| code.canonical_reason().unwrap_or("Error").to_string());
    (
        code,
        Json(json!({
            "request_id": ctx.request_id,
            "title": title,
            "flow": ctx.flow,
            "message": message,
        })),
    )
        .into_response()
}

fn registration_error(ctx: &AuthRequest, code: StatusCode, message: &str) -> Response {
    warn!(
        request_id = ctx.request_id.as_str(),
        error = message,
        "Registration rejected"
    );
    (
        code,
        Json(json!({
            "request_id": ctx.request_id,
            "flow": ctx.flow,
            "message": message,
        })),
    )
        .into_response()
}

impl RegistrationForm {
    fn parse(content_type: &str, bytes: &[u8]) -> Result<Self, String> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/x-www-form-urlencoded" => {
                serde_urlencoded::from_bytes(bytes).map_err(|e| e.to_string())
            },
            "application/json" => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            _ => Err(format!("unsupported content type: {}", content_type)),
        }
    }

    fn validate(&self, portal: &Portal) -> Result<(), &'static str> {
        let registration = portal.registration();
        if let Some(expected) = &registration.code {
            if self.code.as_deref() != Some(expected.as_str()) {
                return Err("invalid registration code");
            }
        }
        if registration.require_accept_terms && !self.accept_terms {
            return Err("terms of use must be accepted");
        }

        let username = self.username.trim();
        if username.is_empty()
            || !username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err("username must be alphanumeric");
        }
        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => {},
            _ => return Err("invalid email address"),
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err("password is too short");
        }
        Ok(())
    }
}

#[async_trait]
impl ResponseDispatcher for DefaultDispatcher {
    async fn serve_login(&self, page: Page<'_>) -> Result<Response, DispatchError> {
        let Page {
            portal, parts, ctx, ..
        } = page;

        if !ctx.authenticated {
            let code = status(ctx.status_code.unwrap_or(200));
            let body = json!({
                "request_id": ctx.request_id,
                "title": portal.ui().title,
                "flow": ctx.flow,
                "message": ctx.message,
                "authenticated": false,
                "login_options": portal.login_options(),
            });
            return Ok((code, Json(body)).into_response());
        }

        let stored_target = redirect_target(&parts.headers);
        let target = stored_target.clone().unwrap_or_else(|| portal_path(portal));
        let mut cookies = Vec::new();
        if stored_target.is_some() {
            cookies.push(portal.cookies().expire(REDIRECT_COOKIE)?);
        }

        // An existing session only needs to be sent on.
        if ctx.authorized {
            return redirect(&target, cookies);
        }

        let Some(claims) = ctx.claims.as_ref() else {
            return Ok(message_page(
                &ctx,
                StatusCode::UNAUTHORIZED,
                &portal.ui().title,
            ));
        };
        let issuer = portal.token_issuer();
        let token = issuer.issue(claims)?;
        cookies.push(
            portal
                .cookies()
                .session_cookie(issuer.token_name(), &token, issuer.lifetime())?,
        );

        if ctx.content_type == ContentType::Json {
            let mut response = (
                StatusCode::OK,
                Json(json!({
                    "request_id": ctx.request_id,
                    "authenticated": true,
                    "token_name": issuer.token_name(),
                    "token": token,
                    "claims": claims,
                    "redirect_url": target,
                })),
            )
                .into_response();
            for cookie in cookies {
                response.headers_mut().append(header::SET_COOKIE, cookie);
            }
            return Ok(response);
        }

        redirect(&target, cookies)
    }

    async fn serve_generic(&self, page: Page<'_>) -> Result<Response, DispatchError> {
        let ctx = &page.ctx;
        let code = match (ctx.status_code, &ctx.flow) {
            (Some(code), _) => status(code),
            (None, Some(Flow::NotFound)) => StatusCode::NOT_FOUND,
            (None, Some(Flow::UnsupportedFeature)) => StatusCode::NOT_IMPLEMENTED,
            (None, _) => StatusCode::OK,
        };
        Ok(message_page(ctx, code, &page.portal.ui().title))
    }

    async fn serve_register(&self, page: Page<'_>) -> Result<Response, DispatchError> {
        let Page {
            portal,
            parts,
            body,
            ctx,
        } = page;
        let registration = portal.registration();

        if parts.method == Method::GET {
            let title = if registration.title.is_empty() {
                "Sign Up"
            } else {
                registration.title.as_str()
            };
            return Ok((
                StatusCode::OK,
                Json(json!({
                    "request_id": ctx.request_id,
                    "title": title,
                    "flow": ctx.flow,
                    "require_registration_code": registration.code.is_some(),
                    "require_accept_terms": registration.require_accept_terms,
                })),
            )
                .into_response());
        }
        if parts.method != Method::POST {
            return Ok(registration_error(
                &ctx,
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            ));
        }

        let bytes = match axum::body::to_bytes(body, MAX_REGISTRATION_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => return Ok(registration_error(&ctx, StatusCode::BAD_REQUEST, &e.to_string())),
        };
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let form = match RegistrationForm::parse(content_type, &bytes) {
            Ok(form) => form,
            Err(e) => return Ok(registration_error(&ctx, StatusCode::BAD_REQUEST, &e)),
        };
        if let Err(reason) = form.validate(portal) {
            return Ok(registration_error(&ctx, StatusCode::BAD_REQUEST, reason));
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = match Argon2::default().hash_password(form.password.as_bytes(), &salt)
        {
            Ok(hash) => hash.to_string(),
            Err(e) => {
                error!(
                    request_id = ctx.request_id.as_str(),
                    error = %e,
                    "Failed to hash registration password"
                );
                return Ok(registration_error(
                    &ctx,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "registration failed",
                ));
            },
        };

        let username = form.username.trim().to_string();
        let record = RegistrationRecord {
            username: username.clone(),
            email: form.email.trim().to_string(),
            password_hash,
            requested_at: unix_now(),
            request_id: ctx.request_id.clone(),
        };
        let value = serde_json::to_vec(&record)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let key = format!("{}/{}", registration.dropbox.trim_end_matches('/'), username);

        match portal.registrations().create(&key, &value).await {
            Ok(()) => {},
            Err(StorageError::AlreadyExists(_)) => {
                return Ok(registration_error(
                    &ctx,
                    StatusCode::CONFLICT,
                    "username is already registered",
                ));
            },
            Err(e) => return Err(e.into()),
        }

        info!(
            request_id = ctx.request_id.as_str(),
            instance_name = portal.name(),
            user = username.as_str(),
            "Registration request accepted"
        );
        Ok((
            StatusCode::CREATED,
            Json(json!({
                "request_id": ctx.request_id,
                "flow": ctx.flow,
                "username": username,
                "message": "Registration request accepted",
            })),
        )
            .into_response())
    }

    async fn serve_session_logoff(&self, page: Page<'_>) -> Result<Response, DispatchError> {
        let Page { portal, ctx, .. } = page;
        if let Some(claims) = &ctx.claims {
            if portal.sessions().remove(&claims.id).await.is_some() {
                info!(
                    request_id = ctx.request_id.as_str(),
                    user = claims.subject.as_str(),
                    "Session terminated"
                );
            }
        }

        let cookies = vec![
            portal
                .cookies()
                .expire(portal.token_issuer().token_name())?,
            portal.cookies().expire(REDIRECT_COOKIE)?,
        ];
        redirect(&login_path(portal), cookies)
    }

    async fn serve_session_login_redirect(
        &self,
        page: Page<'_>,
    ) -> Result<Response, DispatchError> {
        let portal = page.portal;
        let cookies = vec![portal
            .cookies()
            .expire(portal.token_issuer().token_name())?];
        redirect(&login_path(portal), cookies)
    }

    async fn serve_static_assets(&self, page: Page<'_>) -> Result<Response, DispatchError> {
        Ok(message_page(
            &page.ctx,
            StatusCode::NOT_FOUND,
            &page.portal.ui().title,
        ))
    }

    async fn serve_whoami(&self, page: Page<'_>) -> Result<Response, DispatchError> {
        match (&page.ctx.claims, page.ctx.authenticated) {
            (Some(claims), true) => Ok((StatusCode::OK, Json(claims)).into_response()),
            _ => Ok(message_page(
                &page.ctx,
                StatusCode::UNAUTHORIZED,
                &page.portal.ui().title,
            )),
        }
    }

    async fn serve_settings(&self, page: Page<'_>) -> Result<Response, DispatchError> {
        let Page { portal, ctx, .. } = page;
        let Some(claims) = ctx.claims.as_ref().filter(|_| ctx.authenticated) else {
            return redirect(&login_path(portal), Vec::new());
        };

        let session = portal.sessions().get(&claims.id).await.map(|entry| {
            json!({
                "backend": entry.backend,
                "age_secs": entry.created_at.elapsed().as_secs(),
            })
        });
        Ok((
            StatusCode::OK,
            Json(json!({
                "request_id": ctx.request_id,
                "title": "Settings",
                "flow": ctx.flow,
                "claims": claims,
                "session": session,
            })),
        )
            .into_response())
    }

    async fn serve_portal(&self, page: Page<'_>) -> Result<Response, DispatchError> {
        let Page { portal, ctx, .. } = page;
        let Some(claims) = ctx.claims.as_ref().filter(|_| ctx.authenticated) else {
            return redirect(&login_path(portal), Vec::new());
        };

        Ok((
            StatusCode::OK,
            Json(json!({
                "request_id": ctx.request_id,
                "title": portal.ui().title,
                "flow": ctx.flow,
                "claims": claims,
                "links": portal.ui().links,
            })),
        )
            .into_response())
    }
}
