//! Client certificate authentication backend.
//!
//! TLS is terminated by a proxy in front of the gateway. The proxy verifies
//! the client certificate and forwards the verification result and the
//! certificate subject in request headers, which this backend trusts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{AuthAttempt, AuthError, AuthMethod, AuthOutcome, Backend, Claims};

/// Header names set by the TLS terminating proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X509Config {
    /// Header carrying the verification result (`SUCCESS` when verified).
    #[serde(default = "default_verify_header")]
    pub verify_header: String,
    /// Header carrying the certificate subject distinguished name.
    #[serde(default = "default_subject_header")]
    pub subject_header: String,
}

impl Default for X509Config {
    fn default() -> Self {
        Self {
            verify_header: default_verify_header(),
            subject_header: default_subject_header(),
        }
    }
}

fn default_verify_header() -> String {
    "x-ssl-client-verify".to_string()
}

fn default_subject_header() -> String {
    "x-ssl-client-subject".to_string()
}

/// Authentication backend for proxy-verified client certificates.
pub struct X509Backend {
    name: String,
    realm: String,
    config: X509Config,
}

impl X509Backend {
    /// Creates a new client certificate backend.
    pub fn new(name: impl Into<String>, realm: impl Into<String>, config: X509Config) -> Self {
        Self {
            name: name.into(),
            realm: realm.into(),
            config,
        }
    }

    fn header<'a>(attempt: &'a AuthAttempt<'_>, name: &str) -> Option<&'a str> {
        attempt.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Extracts the common name from a distinguished name in either
/// `CN=x,O=y` (RFC 4514) or `/O=y/CN=x` (OpenSSL one-line) form.
fn common_name(subject: &str) -> Option<&str> {
    subject
        .split([',', '/'])
        .filter_map(|rdn| rdn.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("CN"))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl Backend for X509Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn method(&self) -> AuthMethod {
        AuthMethod::X509
    }

    async fn authenticate(&self, attempt: &AuthAttempt<'_>) -> Result<AuthOutcome, AuthError> {
        match Self::header(attempt, &self.config.verify_header) {
            Some(result) if result.eq_ignore_ascii_case("SUCCESS") => {},
            Some(_) => return Err(AuthError::InvalidCredentials),
            None => {
                return Err(AuthError::MalformedRequest(
                    "no client certificate presented".into(),
                ))
            },
        }

        let subject = Self::header(attempt, &self.config.subject_header)
            .ok_or_else(|| AuthError::MalformedRequest("certificate subject missing".into()))?;
        let cn = common_name(subject).ok_or(AuthError::InvalidCredentials)?;

        let mut claims = Claims::for_subject(cn).with_origin(AuthMethod::X509, &self.realm);
        claims
            .extra
            .insert("x509_subject".to_string(), serde_json::Value::from(subject));
        Ok(AuthOutcome::Authenticated(claims))
    }
}
