//! Cookie construction.

use std::time::Duration;

use http::header::InvalidHeaderValue;
use http::{HeaderMap, HeaderValue};
use url::form_urlencoded;
use vestibule_auth::cookie_value;

use crate::config::{CookieConfig, SameSite};

/// Cookie remembering where to send the browser after login.
pub const REDIRECT_COOKIE: &str = "AUTH_PORTAL_REDIRECT_URL";

/// Builds `Set-Cookie` values with the operator-configured attributes.
#[derive(Debug, Clone)]
pub struct CookiePolicy {
    config: CookieConfig,
}

impl CookiePolicy {
    /// Creates a policy from configuration.
    pub fn new(config: CookieConfig) -> Self {
        Self { config }
    }

    /// Attribute suffix shared by every cookie, e.g. `Path=/; Secure; HttpOnly; SameSite=Lax`.
    pub fn attributes(&self) -> String {
        let mut attrs = Vec::with_capacity(5);
        if let Some(domain) = &self.config.domain {
            attrs.push(format!("Domain={}", domain));
        }
        attrs.push(format!("Path={}", self.config.path));
        if self.config.secure {
            attrs.push("Secure".to_string());
        }
        attrs.push("HttpOnly".to_string());
        attrs.push(
            match self.config.same_site {
                SameSite::Lax => "SameSite=Lax",
                SameSite::Strict => "SameSite=Strict",
                SameSite::None => "SameSite=None",
            }
            .to_string(),
        );
        attrs.join("; ")
    }

    /// Cookie carrying the post-login redirect target.
    pub fn redirect_cookie(&self, target: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        let encoded: String = form_urlencoded::byte_serialize(target.as_bytes()).collect();
        HeaderValue::from_str(&format!(
            "{}={}; {}",
            REDIRECT_COOKIE,
            encoded,
            self.attributes()
        ))
    }

    /// Cookie carrying a session token.
    pub fn session_cookie(
        &self,
        name: &str,
        token: &str,
        max_age: Duration,
    ) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&format!(
            "{}={}; Max-Age={}; {}",
            name,
            token,
            max_age.as_secs(),
            self.attributes()
        ))
    }

    /// Cookie instructing the browser to drop `name`.
    pub fn expire(&self, name: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&format!(
            "{}=deleted; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; {}",
            name,
            self.attributes()
        ))
    }
}

/// Reads the post-login redirect target from the request cookies.
///
/// Only same-site paths and absolute `http(s)` URLs are returned.
pub fn redirect_target(headers: &HeaderMap) -> Option<String> {
    let raw = cookie_value(headers, REDIRECT_COOKIE)?;
    let target = form_urlencoded::parse(format!("t={}", raw).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())?;

    let relative = target.starts_with('/') && !target.starts_with("//");
    let absolute = target.starts_with("https://") || target.starts_with("http://");
    (relative || absolute).then_some(target)
}
