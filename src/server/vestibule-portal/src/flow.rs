//! Request classification.
//!
//! Maps the path below a portal's mount point to the route that handles it.

use std::fmt;

use serde::{Serialize, Serializer};

/// Route selected for a request by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `register`
    Register,
    /// `recover`, `forgot`
    Recover,
    /// `logout`, `logoff`
    Logout,
    /// `assets`
    Assets,
    /// `whoami`
    Whoami,
    /// `settings`
    Settings,
    /// `portal`
    Portal,
    /// `saml`, `x509`, `oauth2`: a `{method}/{realm}` backend endpoint.
    Backend,
    /// `login` or the mount point itself.
    Login,
    /// Anything else.
    NotFound,
}

/// Prefixes in match order. The first matching prefix wins.
const PREFIXES: &[(&str, Route)] = &[
    ("register", Route::Register),
    ("recover", Route::Recover),
    ("forgot", Route::Recover),
    ("logout", Route::Logout),
    ("logoff", Route::Logout),
    ("assets", Route::Assets),
    ("whoami", Route::Whoami),
    ("settings", Route::Settings),
    ("portal", Route::Portal),
    ("saml", Route::Backend),
    ("x509", Route::Backend),
    ("oauth2", Route::Backend),
    ("login", Route::Login),
];

/// Strips the mount prefix and one leading `/` from `path`.
pub fn strip_mount<'a>(path: &'a str, mount: &str) -> &'a str {
    let rest = path.strip_prefix(mount).unwrap_or(path);
    rest.strip_prefix('/').unwrap_or(rest)
}

/// Classifies `path` for a portal mounted at `mount`.
///
/// Returns the route and the path remainder below the mount point.
pub fn classify<'a>(path: &'a str, mount: &str) -> (Route, &'a str) {
    let rest = strip_mount(path, mount);
    if rest.is_empty() {
        return (Route::Login, rest);
    }
    let route = PREFIXES
        .iter()
        .find(|(prefix, _)| rest.starts_with(prefix))
        .map(|(_, route)| *route)
        .unwrap_or(Route::NotFound);
    (route, rest)
}

/// Flow recorded in the request context and reported to the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Login form or login result.
    Login,
    /// Session termination.
    Logout,
    /// Self-service registration.
    Register,
    /// Registration disabled, or a reserved flow.
    UnsupportedFeature,
    /// Static assets.
    Assets,
    /// Session introspection.
    Whoami,
    /// Account settings.
    Settings,
    /// Landing page after login.
    Portal,
    /// Delegated backend endpoint, carrying the requested method segment.
    Backend(String),
    /// Backend endpoint path without a realm.
    MalformedBackend,
    /// No backend serves the requested method and realm.
    BackendNotFound,
    /// Backend rejected the request.
    AuthFailed,
    /// Unknown path.
    NotFound,
}

impl Flow {
    /// Flow name as rendered.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Register => "register",
            Self::UnsupportedFeature => "unsupported_feature",
            Self::Assets => "assets",
            Self::Whoami => "whoami",
            Self::Settings => "settings",
            Self::Portal => "portal",
            Self::Backend(method) => method,
            Self::MalformedBackend => "malformed_backend",
            Self::BackendNotFound => "backend_not_found",
            Self::AuthFailed => "auth_failed",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Flow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
