//! Login credential parsing.
//!
//! Credentials arrive either as a `POST` body (form or JSON) or in an
//! `Authorization: Basic` header. A request carrying neither has no credentials.

use axum::body::Body;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::request::Parts;
use http::{header, Method};
use serde::Deserialize;
use vestibule_auth::Credentials;

use crate::error::CredentialsError;

/// Realm assumed when the submission does not name one.
pub const DEFAULT_REALM: &str = "local";

/// Largest accepted credentials body.
const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    realm: Option<String>,
}

impl LoginForm {
    fn into_credentials(self) -> Result<Credentials, CredentialsError> {
        if self.username.trim().is_empty() {
            return Err(CredentialsError::MissingField("username"));
        }
        if self.password.is_empty() {
            return Err(CredentialsError::MissingField("password"));
        }
        let realm = self
            .realm
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REALM.to_string());
        Ok(Credentials {
            username: self.username.trim().to_string(),
            password: self.password,
            realm,
        })
    }
}

/// Reads login credentials from the request.
///
/// # Returns
///
/// * `Ok(Some(_))` - Credentials were submitted
/// * `Ok(None)` - The request carries no credentials (e.g. a plain `GET`)
/// * `Err(_)` - Credentials were submitted but cannot be used
pub async fn parse_credentials(
    parts: &Parts,
    body: Body,
) -> Result<Option<Credentials>, CredentialsError> {
    if parts.method == Method::POST {
        let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| CredentialsError::Body(e.to_string()))?;
        if !bytes.is_empty() {
            return parse_body(parts, &bytes).map(Some);
        }
    }

    basic_credentials(parts)
}

fn parse_body(parts: &Parts, bytes: &[u8]) -> Result<Credentials, CredentialsError> {
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let form: LoginForm = match mime.as_str() {
        "application/x-www-form-urlencoded" => serde_urlencoded::from_bytes(bytes)
            .map_err(|e| CredentialsError::Malformed(e.to_string()))?,
        "application/json" => serde_json::from_slice(bytes)
            .map_err(|e| CredentialsError::Malformed(e.to_string()))?,
        _ => return Err(CredentialsError::UnsupportedContentType(content_type.to_string())),
    };
    form.into_credentials()
}

fn basic_credentials(parts: &Parts) -> Result<Option<Credentials>, CredentialsError> {
    let Some(encoded) = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return Ok(None);
    };

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CredentialsError::Malformed(e.to_string()))?;
    let decoded =
        String::from_utf8(decoded).map_err(|e| CredentialsError::Malformed(e.to_string()))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| CredentialsError::Malformed("basic credentials lack ':'".into()))?;

    LoginForm {
        username: username.to_string(),
        password: password.to_string(),
        realm: None,
    }
    .into_credentials()
    .map(Some)
}
