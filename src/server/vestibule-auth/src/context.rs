//! Authentication context types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AuthError;

/// Method used to authenticate the request.
///
/// The set is closed: every backend registered with a portal declares one of
/// these, and delegated callback paths are routed on its string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Username and password checked against locally configured users.
    Local,
    /// Directory bind.
    Ldap,
    /// OAuth 2.0 / OpenID Connect authorization-code flow.
    Oauth2,
    /// SAML 2.0 assertion consumer.
    Saml,
    /// Client certificate.
    X509,
}

impl AuthMethod {
    /// Returns the tag used in URLs, configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ldap => "ldap",
            Self::Oauth2 => "oauth2",
            Self::Saml => "saml",
            Self::X509 => "x509",
        }
    }

    /// Whether the method is driven through a `{method}/{realm}` callback path
    /// rather than the login form.
    pub fn is_delegated(&self) -> bool {
        matches!(self, Self::Oauth2 | Self::Saml | Self::X509)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "ldap" => Ok(Self::Ldap),
            "oauth2" => Ok(Self::Oauth2),
            "saml" => Ok(Self::Saml),
            "x509" => Ok(Self::X509),
            other => Err(AuthError::MethodNotEnabled(other.to_string())),
        }
    }
}

/// Verified attributes of an authenticated subject.
///
/// Field names follow the registered JWT claim names so the same struct is
/// used for session tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Session identifier, used as the session cache key.
    #[serde(rename = "jti", default)]
    pub id: String,

    /// Subject (username, provider account id, certificate CN).
    #[serde(rename = "sub", default)]
    pub subject: String,

    /// URL of the portal that authenticated the subject.
    #[serde(rename = "iss", default, skip_serializing_if = "String::is_empty")]
    pub issuer: String,

    /// Source address the session was established from.
    #[serde(rename = "addr", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Roles granted by the backend.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    /// Identity source, e.g. `"oauth2/google"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Expiration (Unix seconds).
    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,

    /// Issued at (Unix seconds).
    #[serde(rename = "iat", default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<u64>,

    /// Backend-supplied attributes without a dedicated field.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Claims {
    /// Creates claims for the given subject with every other field empty.
    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }

    /// Stamps the identity source and derives the session id from it.
    ///
    /// The id is `{method}/{realm}/{subject}`, so repeated logins of one
    /// subject through one backend share a session cache entry.
    pub fn with_origin(mut self, method: AuthMethod, realm: &str) -> Self {
        let origin = format!("{}/{}", method, realm);
        self.id = format!("{}/{}", origin, self.subject);
        self.origin = Some(origin);
        self
    }
}

/// Username/password credentials submitted to the login form.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username.
    pub username: String,
    /// Password in clear text, only held for the duration of the request.
    pub password: String,
    /// Realm selecting which backends the credentials are checked against.
    pub realm: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("realm", &self.realm)
            .finish()
    }
}

/// Identity of the backend that established a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendIdentity {
    /// Operator-assigned backend name.
    pub name: String,
    /// Backend realm.
    pub realm: String,
    /// Backend method.
    pub method: AuthMethod,
}
