//! Integration tests for the Vestibule gateway.
//!
//! These tests drive the portal router in-process, from configuration file
//! to rendered responses.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use axum::body::Body;
use axum::Router;
use http::{header, Request, Response};
use rand::rngs::OsRng;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tower::ServiceExt;
use vestibule_auth::SessionCache;
use vestibule_portal::{router, GatewayConfig, PortalRegistry};

/// Signing secret of the default test portal.
pub const SECRET: &str = "integration-test-secret-0123456789";

/// Password of the local test user `alice`.
pub const PASSWORD: &str = "correct horse battery";

// ============================================================================
// Test Gateway
// ============================================================================

/// A gateway built from a configuration file, served in-process.
pub struct TestGateway {
    pub app: Router,
    pub sessions: Arc<SessionCache>,
    _config: NamedTempFile,
}

impl TestGateway {
    /// Writes `config` to a file and provisions the gateway from it.
    pub fn start(config: Value) -> Result<Self> {
        let mut file = NamedTempFile::new().context("Failed to create config file")?;
        file.write_all(config.to_string().as_bytes())?;

        let config = GatewayConfig::load(file.path())?;
        let sessions = Arc::new(SessionCache::new(Duration::from_secs(
            config.session_ttl_secs,
        )));
        let registry = PortalRegistry::from_config(&config, Arc::clone(&sessions))?;

        Ok(Self {
            app: router(&registry),
            sessions,
            _config: file,
        })
    }

    /// Gateway with the default portal.
    pub fn default_portal() -> Self {
        Self::start(default_config()).unwrap()
    }

    /// Sends one request through the router.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }
}

fn hash(password: &str) -> String {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

/// One primary portal at `/auth` with local, x509 and registration support.
pub fn default_config() -> Value {
    json!({
        "session_ttl_secs": 600,
        "portals": [{
            "name": "default",
            "primary": true,
            "auth_url_path": "/auth",
            "ui": { "title": "Example Sign In" },
            "registration": { "dropbox": "registrations", "code": "INVITE" },
            "cookies": { "secure": false },
            "token": { "secret": SECRET, "lifetime_secs": 300 },
            "source_ip_tracking": true,
            "backends": [
                {
                    "method": "local",
                    "name": "local",
                    "realm": "local",
                    "users": [{
                        "username": "alice",
                        "password_hash": hash(PASSWORD),
                        "email": "alice@example.com",
                        "roles": ["admin"]
                    }]
                },
                {
                    "method": "x509",
                    "name": "corp-pki",
                    "realm": "corp"
                }
            ]
        }]
    })
}

// ============================================================================
// Request and Response Helpers
// ============================================================================

/// `GET` request with optional cookies.
pub fn get(uri: &str, cookies: &[&str]) -> Request<Body> {
    let mut builder = Request::builder().uri(uri).header(header::HOST, "gw.example.com");
    if !cookies.is_empty() {
        builder = builder.header(header::COOKIE, cookies.join("; "));
    }
    builder.body(Body::empty()).unwrap()
}

/// Form login request.
pub fn form_login(username: &str, password: &str, cookies: &[&str]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header(header::HOST, "gw.example.com")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if !cookies.is_empty() {
        builder = builder.header(header::COOKIE, cookies.join("; "));
    }
    builder
        .body(Body::from(format!(
            "username={}&password={}&realm=local",
            username,
            password.replace(' ', "+")
        )))
        .unwrap()
}

/// `name=value` of a cookie set by the response.
pub fn set_cookie(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&format!("{}=", name)))
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

/// `Location` header of the response.
pub fn location(response: &Response<Body>) -> &str {
    response.headers()[header::LOCATION].to_str().unwrap()
}

/// Reads a JSON response body.
pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn expired_token() -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = json!({
            "jti": "old-session",
            "sub": "alice",
            "iat": now - 7200,
            "exp": now - 3600,
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_login_page_lists_options() {
        let gateway = TestGateway::default_portal();

        let response = gateway.send(get("/auth", &[])).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["title"], "Example Sign In");
        assert_eq!(body["authenticated"], false);
        assert_eq!(body["flow"], "login");
        assert_eq!(body["login_options"]["form_realms"][0]["realm"], "local");
        assert_eq!(
            body["login_options"]["external_logins"][0]["path"],
            "/auth/x509/corp"
        );
        assert_eq!(body["login_options"]["registration_enabled"], true);
    }

    #[tokio::test]
    async fn test_local_login_session_lifecycle() {
        let gateway = TestGateway::default_portal();

        // Login issues the session cookie and lands on the portal page.
        let response = gateway.send(form_login("alice", PASSWORD, &[])).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/auth/portal");
        let session = set_cookie(&response, "access_token").unwrap();
        assert_eq!(gateway.sessions.len().await, 1);

        // The token identifies the subject.
        let response = gateway.send(get("/auth/whoami", &[&session])).await;
        assert_eq!(response.status(), StatusCode::OK);
        let claims = json_body(response).await;
        assert_eq!(claims["sub"], "alice");
        assert_eq!(claims["email"], "alice@example.com");
        assert_eq!(claims["origin"], "local/local");
        assert_eq!(claims["iss"], "http://gw.example.com/auth/login");

        // Settings resolve the backend that established the session.
        let response = gateway.send(get("/auth/settings", &[&session])).await;
        assert_eq!(response.status(), StatusCode::OK);
        let settings = json_body(response).await;
        assert_eq!(settings["session"]["backend"]["name"], "local");
        assert_eq!(settings["session"]["backend"]["method"], "local");

        // An authenticated visit to the login page is sent on.
        let response = gateway.send(get("/auth/login", &[&session])).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/auth/portal");
        assert!(set_cookie(&response, "access_token").is_none());

        // Logout evicts the session and clears the cookie.
        let response = gateway.send(get("/auth/logout", &[&session])).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/auth");
        assert_eq!(
            set_cookie(&response, "access_token").as_deref(),
            Some("access_token=deleted")
        );
        assert!(gateway.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_repeated_logins_share_one_session() {
        let gateway = TestGateway::default_portal();

        let mut sessions = Vec::new();
        for _ in 0..3 {
            let response = gateway.send(form_login("alice", PASSWORD, &[])).await;
            assert_eq!(response.status(), StatusCode::FOUND);
            sessions.push(set_cookie(&response, "access_token").unwrap());
        }
        assert_eq!(gateway.sessions.len().await, 1);
        assert!(gateway.sessions.get("local/local/alice").await.is_some());

        // Every token issued to alice names the same cache entry.
        let response = gateway.send(get("/auth/whoami", &[&sessions[0]])).await;
        assert_eq!(json_body(response).await["jti"], "local/local/alice");

        // Logging out from the latest login removes the shared entry.
        gateway.send(get("/auth/logout", &[&sessions[2]])).await;
        assert!(gateway.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_json_login_returns_token() {
        let gateway = TestGateway::default_portal();
        let request = Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json")
            .header("x-forwarded-for", "198.51.100.4, 10.0.0.1")
            .body(Body::from(
                json!({ "username": "alice", "password": PASSWORD }).to_string(),
            ))
            .unwrap();

        let response = gateway.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["claims"]["addr"], "198.51.100.4");
        let token = body["token"].as_str().unwrap().to_string();

        let request = Request::builder()
            .uri("/auth/whoami")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let response = gateway.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["sub"], "alice");
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let gateway = TestGateway::default_portal();

        let response = gateway.send(form_login("alice", "not it", &[])).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(set_cookie(&response, "access_token").is_none());
        let body = json_body(response).await;
        assert_eq!(body["message"], "Authentication failed");
        assert!(gateway.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_basic_authorization_login() {
        let gateway = TestGateway::default_portal();
        let request = Request::builder()
            .uri("/auth/login")
            .header(header::ACCEPT, "application/json")
            .header(
                header::AUTHORIZATION,
                "Basic YWxpY2U6Y29ycmVjdCBob3JzZSBiYXR0ZXJ5",
            )
            .body(Body::empty())
            .unwrap();

        let response = gateway.send(request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["claims"]["sub"], "alice");
    }

    #[tokio::test]
    async fn test_redirect_target_round_trip() {
        let gateway = TestGateway::default_portal();

        let response = gateway
            .send(get("/auth?redirect_url=%2Fapp%2Fhome", &[]))
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/auth");
        let remembered = set_cookie(&response, "AUTH_PORTAL_REDIRECT_URL").unwrap();

        let response = gateway
            .send(form_login("alice", PASSWORD, &[&remembered]))
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/app/home");
        assert_eq!(
            set_cookie(&response, "AUTH_PORTAL_REDIRECT_URL").as_deref(),
            Some("AUTH_PORTAL_REDIRECT_URL=deleted")
        );
    }

    #[tokio::test]
    async fn test_protocol_relative_redirect_ignored() {
        let gateway = TestGateway::default_portal();
        let cookie = "AUTH_PORTAL_REDIRECT_URL=%2F%2Fevil.example.com";

        let response = gateway.send(form_login("alice", PASSWORD, &[cookie])).await;

        assert_eq!(location(&response), "/auth/portal");
    }

    #[tokio::test]
    async fn test_expired_token_returns_to_login() {
        let gateway = TestGateway::default_portal();
        let cookie = format!("access_token={}", expired_token());

        let response = gateway.send(get("/auth/whoami", &[&cookie])).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/auth");
        assert_eq!(
            set_cookie(&response, "access_token").as_deref(),
            Some("access_token=deleted")
        );
    }

    #[tokio::test]
    async fn test_x509_delegated_login() {
        let gateway = TestGateway::default_portal();
        let request = Request::builder()
            .uri("/auth/x509/corp")
            .header(header::HOST, "gw.example.com")
            .header("x-ssl-client-verify", "SUCCESS")
            .header("x-ssl-client-subject", "CN=bob,O=Example Corp")
            .body(Body::empty())
            .unwrap();

        let response = gateway.send(request).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/auth/portal");
        let session = set_cookie(&response, "access_token").unwrap();

        let response = gateway.send(get("/auth/settings", &[&session])).await;
        let settings = json_body(response).await;
        assert_eq!(settings["claims"]["sub"], "bob");
        assert_eq!(settings["session"]["backend"]["name"], "corp-pki");
        assert_eq!(settings["session"]["backend"]["method"], "x509");
    }

    #[tokio::test]
    async fn test_x509_unverified_certificate() {
        let gateway = TestGateway::default_portal();
        let request = Request::builder()
            .uri("/auth/x509/corp")
            .header("x-ssl-client-verify", "FAILED:unknown ca")
            .header("x-ssl-client-subject", "CN=bob")
            .body(Body::empty())
            .unwrap();

        let response = gateway.send(request).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["flow"], "auth_failed");
        assert!(gateway.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_backend_routing_errors() {
        let gateway = TestGateway::default_portal();

        let response = gateway.send(get("/auth/x509", &[])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["flow"], "malformed_backend");

        let response = gateway.send(get("/auth/oauth2/google", &[])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["flow"], "backend_not_found");
    }

    #[tokio::test]
    async fn test_generic_pages() {
        let gateway = TestGateway::default_portal();

        let response = gateway.send(get("/auth/forgot", &[])).await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(json_body(response).await["flow"], "unsupported_feature");

        let response = gateway.send(get("/auth/nowhere", &[])).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["flow"], "not_found");

        let response = gateway.send(get("/auth/assets/site.css", &[])).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = gateway.send(get("/auth/whoami", &[])).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = gateway.send(get("/auth/portal", &[])).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/auth");
    }

    #[tokio::test]
    async fn test_registration() {
        let gateway = TestGateway::default_portal();
        let register = |code: &str| {
            Request::builder()
                .method("POST")
                .uri("/auth/register")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "username": "carol",
                        "password": "a long password",
                        "email": "carol@example.com",
                        "code": code,
                    })
                    .to_string(),
                ))
                .unwrap()
        };

        let response = gateway.send(get("/auth/register", &[])).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["require_registration_code"], true);

        let response = gateway.send(register("WRONG")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = gateway.send(register("INVITE")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["username"], "carol");

        let response = gateway.send(register("INVITE")).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_registration_disabled() {
        let mut config = default_config();
        config["portals"][0]["registration"] = json!({ "disabled": true, "dropbox": "r" });
        let gateway = TestGateway::start(config).unwrap();

        let response = gateway.send(get("/auth/register", &[])).await;

        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(json_body(response).await["flow"], "unsupported_feature");
    }

    #[tokio::test]
    async fn test_portals_are_isolated() {
        let mut config = default_config();
        config["portals"]
            .as_array_mut()
            .unwrap()
            .push(json!({
                "name": "partners",
                "auth_url_path": "/partners",
                "ui": { "title": "Partner Sign In" },
                "token": { "name": "partner_token", "secret": "another-secret-0123456789" }
            }));
        let gateway = TestGateway::start(config).unwrap();

        let response = gateway.send(get("/partners/login", &[])).await;
        assert_eq!(json_body(response).await["title"], "Partner Sign In");

        // A session of one portal is not accepted by the other.
        let response = gateway.send(form_login("alice", PASSWORD, &[])).await;
        let session = set_cookie(&response, "access_token").unwrap();
        let cookie = session.replace("access_token=", "partner_token=");
        let response = gateway.send(get("/partners/whoami", &[&cookie])).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = default_config();
        config["portals"][0]["token"]["secret"] = json!("");

        assert!(TestGateway::start(config).is_err());
    }
}
