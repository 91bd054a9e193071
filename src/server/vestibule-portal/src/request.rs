//! Request inspection helpers.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use http::request::Parts;
use http::{header, Extensions, HeaderMap, Uri};
use url::form_urlencoded;
use uuid::Uuid;

/// Correlation id of a request.
///
/// Host middleware may insert one before the portal runs; otherwise the
/// portal generates it. Client-supplied headers are never used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Returns the request's correlation id, generating and recording one if absent.
pub fn request_id(extensions: &mut Extensions) -> String {
    if let Some(RequestId(id)) = extensions.get::<RequestId>() {
        if !id.is_empty() {
            return id.clone();
        }
    }
    let id = Uuid::new_v4().to_string();
    extensions.insert(RequestId(id.clone()));
    id
}

/// Decoded query parameters; the first occurrence of a name wins.
pub fn query_params(uri: &Uri) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(query) = uri.query() {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            params
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
    }
    params
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Scheme and authority the request was addressed to, honouring proxy headers.
pub fn base_url(parts: &Parts) -> String {
    let scheme = header_str(&parts.headers, "x-forwarded-proto")
        .or_else(|| parts.uri.scheme_str())
        .unwrap_or("http");
    let host = header_str(&parts.headers, "x-forwarded-host")
        .or_else(|| header_str(&parts.headers, header::HOST.as_str()))
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .unwrap_or("localhost");
    format!("{}://{}", scheme, host)
}

/// Canonical URL of the request, without the query string.
pub fn current_url(parts: &Parts) -> String {
    format!("{}{}", base_url(parts), parts.uri.path())
}

/// Client address: `X-Real-IP`, then the first `X-Forwarded-For` hop, then the peer address.
pub fn source_address(parts: &Parts) -> String {
    if let Some(ip) = header_str(&parts.headers, "x-real-ip") {
        return ip.to_string();
    }
    if let Some(first) = header_str(&parts.headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Response encoding preferred by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// `text/html`
    Html,
    /// `application/json`
    Json,
    /// `text/plain`
    Plain,
}

impl ContentType {
    /// Detects the preferred type from the `Accept` header.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let accept = header_str(headers, header::ACCEPT.as_str()).unwrap_or_default();
        if accept.contains("application/json") {
            Self::Json
        } else if accept.starts_with("text/plain") {
            Self::Plain
        } else {
            Self::Html
        }
    }
}
