//! Gateway configuration.
//!
//! The server reads one JSON document describing every portal it hosts.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vestibule_auth::{
    AuthMethod, Backend, LocalBackend, LocalUser, OAuth2Backend, OAuth2Config, X509Backend,
    X509Config,
};

use crate::error::ConfigError;

fn default_session_ttl_secs() -> u64 {
    3600
}

fn default_auth_url_path() -> String {
    "/auth".to_string()
}

fn default_title() -> String {
    "Sign In".to_string()
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_token_name() -> String {
    "access_token".to_string()
}

fn default_token_lifetime_secs() -> u64 {
    900
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Lifetime of session cache entries, shared by all portals.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Hosted portals.
    pub portals: Vec<PortalConfig>,
}

impl GatewayConfig {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every portal plus the cross-portal constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.portals.is_empty() {
            return Err(ConfigError::Invalid("no portals configured".into()));
        }
        if self.session_ttl_secs == 0 {
            return Err(ConfigError::Invalid("session_ttl_secs must be > 0".into()));
        }

        let mut names = HashSet::new();
        let mut mounts = HashSet::new();
        for portal in &self.portals {
            portal.validate()?;
            if !names.insert(portal.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate portal name: {}",
                    portal.name
                )));
            }
            if !mounts.insert(portal.auth_url_path.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate auth_url_path: {}",
                    portal.auth_url_path
                )));
            }
        }

        if self.portals.iter().filter(|p| p.primary).count() > 1 {
            return Err(ConfigError::Invalid(
                "at most one portal may be primary".into(),
            ));
        }
        Ok(())
    }
}

/// Policy for credentials whose realm matches more than one backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealmMatchPolicy {
    /// Try every matching backend in configuration order; the last one tried
    /// determines the outcome.
    #[default]
    LastMatchWins,
    /// Try matching backends in configuration order and stop at the first success.
    FirstSuccessWins,
}

/// One authentication portal.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PortalConfig {
    /// Unique portal name.
    pub name: String,

    /// Whether this is the primary portal of the gateway.
    #[serde(default)]
    pub primary: bool,

    /// Path prefix the portal is mounted at.
    #[serde(default = "default_auth_url_path")]
    pub auth_url_path: String,

    /// Page settings handed to the renderer.
    #[serde(default)]
    pub ui: UiConfig,

    /// Self-service registration.
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Cookie attributes.
    #[serde(default)]
    pub cookies: CookieConfig,

    /// Session token settings.
    pub token: TokenConfig,

    /// Record the client address in issued claims.
    #[serde(default)]
    pub source_ip_tracking: bool,

    /// How login credentials are matched against backends sharing a realm.
    #[serde(default)]
    pub realm_match_policy: RealmMatchPolicy,

    /// Identity backends.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl PortalConfig {
    /// Checks this portal's constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("portal name is empty".into()));
        }
        if !self.auth_url_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "portal {}: auth_url_path must start with '/'",
                self.name
            )));
        }
        if self.token.secret.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "portal {}: token secret is empty",
                self.name
            )));
        }
        if self.token.name.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "portal {}: token name is empty",
                self.name
            )));
        }

        if self.registration.enabled() {
            vestibule_storage::validate_key(self.registration.dropbox.trim_end_matches('/'))
                .map_err(|e| {
                    ConfigError::Invalid(format!(
                        "portal {}: registration dropbox: {}",
                        self.name, e
                    ))
                })?;
        }

        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        for backend in &self.backends {
            if backend.name().is_empty() || backend.realm().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "portal {}: backend name and realm must be set",
                    self.name
                )));
            }
            if !names.insert(backend.name()) {
                return Err(ConfigError::Invalid(format!(
                    "portal {}: duplicate backend name {}",
                    self.name,
                    backend.name()
                )));
            }
            if !addresses.insert((backend.method(), backend.realm())) {
                return Err(ConfigError::Invalid(format!(
                    "portal {}: duplicate backend {}/{}",
                    self.name,
                    backend.method(),
                    backend.realm()
                )));
            }
        }
        Ok(())
    }
}

/// Page settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct UiConfig {
    /// Page title.
    pub title: String,
    /// Links shown on the portal page.
    pub links: Vec<UiLink>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            links: Vec::new(),
        }
    }
}

/// A link shown on the portal page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UiLink {
    /// Link text.
    pub title: String,
    /// Target URL.
    pub link: String,
}

/// Self-service registration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RegistrationConfig {
    /// Registration is switched off.
    pub disabled: bool,
    /// Store namespace receiving registration requests; empty disables registration.
    pub dropbox: String,
    /// Page title.
    pub title: String,
    /// Invitation code registrants must supply.
    pub code: Option<String>,
    /// Registrants must accept the terms of use.
    pub require_accept_terms: bool,
}

impl RegistrationConfig {
    /// Whether the registration flow is served.
    pub fn enabled(&self) -> bool {
        !self.disabled && !self.dropbox.is_empty()
    }
}

/// SameSite cookie attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    /// `SameSite=Lax`
    #[default]
    Lax,
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=None`
    None,
}

/// Cookie attributes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CookieConfig {
    /// `Domain` attribute.
    pub domain: Option<String>,
    /// `Path` attribute.
    pub path: String,
    /// Add the `Secure` attribute.
    pub secure: bool,
    /// `SameSite` attribute.
    pub same_site: SameSite,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            domain: None,
            path: default_cookie_path(),
            secure: default_true(),
            same_site: SameSite::default(),
        }
    }
}

/// Session token settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    /// Session cookie name.
    #[serde(default = "default_token_name")]
    pub name: String,
    /// HMAC signing secret.
    pub secret: String,
    /// Token lifetime in seconds.
    #[serde(default = "default_token_lifetime_secs")]
    pub lifetime_secs: u64,
}

/// One identity backend, tagged by its method.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Locally defined users.
    Local {
        /// Backend name.
        name: String,
        /// Backend realm.
        realm: String,
        /// Users with Argon2id password hashes.
        #[serde(default)]
        users: Vec<LocalUser>,
    },
    /// OAuth 2.0 provider.
    Oauth2 {
        /// Backend name.
        name: String,
        /// Backend realm.
        realm: String,
        /// Provider endpoints and client registration.
        #[serde(flatten)]
        provider: OAuth2Config,
    },
    /// Client certificates verified by a TLS terminating proxy.
    X509 {
        /// Backend name.
        name: String,
        /// Backend realm.
        realm: String,
        /// Proxy header names.
        #[serde(flatten)]
        headers: X509Config,
    },
}

impl BackendConfig {
    /// Backend name.
    pub fn name(&self) -> &str {
        match self {
            Self::Local { name, .. } | Self::Oauth2 { name, .. } | Self::X509 { name, .. } => name,
        }
    }

    /// Backend realm.
    pub fn realm(&self) -> &str {
        match self {
            Self::Local { realm, .. } | Self::Oauth2 { realm, .. } | Self::X509 { realm, .. } => {
                realm
            },
        }
    }

    /// Backend method.
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::Local { .. } => AuthMethod::Local,
            Self::Oauth2 { .. } => AuthMethod::Oauth2,
            Self::X509 { .. } => AuthMethod::X509,
        }
    }

    /// Constructs the backend.
    pub fn build(&self) -> Result<Arc<dyn Backend>, ConfigError> {
        let backend: Arc<dyn Backend> = match self {
            Self::Local { name, realm, users } => {
                Arc::new(LocalBackend::new(name, realm, users.clone()))
            },
            Self::Oauth2 {
                name,
                realm,
                provider,
            } => Arc::new(
                OAuth2Backend::new(name, realm, provider.clone()).map_err(|source| {
                    ConfigError::Backend {
                        name: name.clone(),
                        source,
                    }
                })?,
            ),
            Self::X509 {
                name,
                realm,
                headers,
            } => Arc::new(X509Backend::new(name, realm, headers.clone())),
        };
        Ok(backend)
    }
}
