//! Authentication portal.
//!
//! [`Portal::handle`] evaluates one request: it validates any session token,
//! classifies the path, runs the matching backend(s) and hands the resulting
//! context to the response dispatcher.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::response::Response;
use http::request::Parts;
use http::{header, HeaderValue, Method, Request, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};
use vestibule_auth::{
    AuthAttempt, AuthError, AuthOutcome, Backend, Claims, Credentials, JwtConfig, JwtTokens,
    SessionCache, TokenIssuer, TokenValidator,
};
use vestibule_storage::{MemoryBackend, StorageBackend};

use crate::config::{PortalConfig, RealmMatchPolicy, RegistrationConfig, UiConfig};
use crate::context::AuthRequest;
use crate::cookies::CookiePolicy;
use crate::credentials::parse_credentials;
use crate::dispatcher::{Page, ResponseDispatcher};
use crate::error::{ConfigError, PortalError};
use crate::flow::{classify, Flow, Route};
use crate::render::DefaultDispatcher;
use crate::request::{self, ContentType};

/// Session cache lifetime used when the builder is not given a cache.
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Renderer entry point selected for a request.
#[derive(Debug, Clone, Copy)]
enum Target {
    Login,
    Generic,
    Register,
    SessionLogoff,
    SessionLoginRedirect,
    StaticAssets,
    Whoami,
    Settings,
    Portal,
}

/// A realm offering form-based login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormRealm {
    /// Realm submitted with the credentials.
    pub realm: String,
    /// Backend method serving the realm.
    pub method: String,
}

/// A sign-in link to a delegated backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalLogin {
    /// Backend name.
    pub name: String,
    /// Backend realm.
    pub realm: String,
    /// Backend method.
    pub method: String,
    /// Portal path starting the flow.
    pub path: String,
}

/// Login page options derived from the configured backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoginOptions {
    /// Realms accepting username/password.
    pub form_realms: Vec<FormRealm>,
    /// Delegated sign-in links.
    pub external_logins: Vec<ExternalLogin>,
    /// Whether the registration link is offered.
    pub registration_enabled: bool,
}

impl LoginOptions {
    fn from_backends(
        backends: &[Arc<dyn Backend>],
        auth_url_path: &str,
        registration: &RegistrationConfig,
    ) -> Self {
        let mut options = Self {
            registration_enabled: registration.enabled(),
            ..Self::default()
        };
        let base = auth_url_path.trim_end_matches('/');
        let mut seen = HashSet::new();
        for backend in backends {
            let method = backend.method();
            if method.is_delegated() {
                options.external_logins.push(ExternalLogin {
                    name: backend.name().to_string(),
                    realm: backend.realm().to_string(),
                    method: method.to_string(),
                    path: format!("{}/{}/{}", base, method, backend.realm()),
                });
            } else if seen.insert(backend.realm().to_string()) {
                options.form_realms.push(FormRealm {
                    realm: backend.realm().to_string(),
                    method: method.to_string(),
                });
            }
        }
        options
    }
}

/// Builder for [`Portal`].
pub struct PortalBuilder {
    name: String,
    primary: bool,
    auth_url_path: String,
    ui: UiConfig,
    registration: RegistrationConfig,
    cookies: CookiePolicy,
    source_ip_tracking: bool,
    realm_policy: RealmMatchPolicy,
    backends: Vec<Arc<dyn Backend>>,
    validator: Option<Arc<dyn TokenValidator>>,
    issuer: Option<Arc<dyn TokenIssuer>>,
    dispatcher: Option<Arc<dyn ResponseDispatcher>>,
    sessions: Option<Arc<SessionCache>>,
    registrations: Option<Arc<dyn StorageBackend>>,
}

impl PortalBuilder {
    /// Starts a builder with defaults: mounted at `/auth`, no backends.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary: false,
            auth_url_path: "/auth".to_string(),
            ui: UiConfig::default(),
            registration: RegistrationConfig::default(),
            cookies: CookiePolicy::new(Default::default()),
            source_ip_tracking: false,
            realm_policy: RealmMatchPolicy::default(),
            backends: Vec::new(),
            validator: None,
            issuer: None,
            dispatcher: None,
            sessions: None,
            registrations: None,
        }
    }

    /// Starts a builder from configuration, constructing backends and session tokens.
    pub fn from_config(config: &PortalConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let tokens = Arc::new(JwtTokens::new(JwtConfig {
            token_name: config.token.name.clone(),
            secret: config.token.secret.clone(),
            lifetime: Duration::from_secs(config.token.lifetime_secs),
        }));

        let mut builder = Self::new(&config.name)
            .primary(config.primary)
            .auth_url_path(&config.auth_url_path)
            .ui(config.ui.clone())
            .registration(config.registration.clone())
            .cookies(CookiePolicy::new(config.cookies.clone()))
            .source_ip_tracking(config.source_ip_tracking)
            .realm_match_policy(config.realm_match_policy)
            .tokens(tokens);
        for backend in &config.backends {
            builder = builder.backend(backend.build()?);
        }
        Ok(builder)
    }

    /// Marks the portal as the gateway's primary portal.
    pub fn primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        self
    }

    /// Sets the mount path.
    pub fn auth_url_path(mut self, path: impl Into<String>) -> Self {
        self.auth_url_path = path.into();
        self
    }

    /// Sets page settings.
    pub fn ui(mut self, ui: UiConfig) -> Self {
        self.ui = ui;
        self
    }

    /// Sets registration settings.
    pub fn registration(mut self, registration: RegistrationConfig) -> Self {
        self.registration = registration;
        self
    }

    /// Sets the cookie policy.
    pub fn cookies(mut self, cookies: CookiePolicy) -> Self {
        self.cookies = cookies;
        self
    }

    /// Records client addresses in issued claims.
    pub fn source_ip_tracking(mut self, enabled: bool) -> Self {
        self.source_ip_tracking = enabled;
        self
    }

    /// Sets the policy for backends sharing a realm.
    pub fn realm_match_policy(mut self, policy: RealmMatchPolicy) -> Self {
        self.realm_policy = policy;
        self
    }

    /// Appends a backend. Backends are tried in the order they are added.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Uses one JWT implementation as both validator and issuer.
    pub fn tokens(mut self, tokens: Arc<JwtTokens>) -> Self {
        self.validator = Some(tokens.clone());
        self.issuer = Some(tokens);
        self
    }

    /// Sets the session token validator.
    pub fn token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Sets the session token issuer.
    pub fn token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Sets the response dispatcher. Defaults to [`DefaultDispatcher`].
    pub fn dispatcher(mut self, dispatcher: Arc<dyn ResponseDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Shares a session cache, typically across all portals of a gateway.
    pub fn sessions(mut self, sessions: Arc<SessionCache>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Sets the store receiving registrations. Defaults to an in-memory store.
    pub fn registrations(mut self, store: Arc<dyn StorageBackend>) -> Self {
        self.registrations = Some(store);
        self
    }

    /// Validates the assembled portal.
    pub fn build(self) -> Result<Portal, ConfigError> {
        if !self.auth_url_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "portal {}: auth_url_path must start with '/'",
                self.name
            )));
        }

        let mut addresses = HashSet::new();
        for backend in &self.backends {
            if !addresses.insert((backend.method(), backend.realm().to_string())) {
                return Err(ConfigError::Invalid(format!(
                    "portal {}: duplicate backend {}/{}",
                    self.name,
                    backend.method(),
                    backend.realm()
                )));
            }
        }

        let validator = self.validator.ok_or_else(|| {
            ConfigError::Invalid(format!("portal {}: no token validator", self.name))
        })?;
        let issuer = self.issuer.ok_or_else(|| {
            ConfigError::Invalid(format!("portal {}: no token issuer", self.name))
        })?;

        let dispatcher: Arc<dyn ResponseDispatcher> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(DefaultDispatcher),
        };
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(SessionCache::new(DEFAULT_SESSION_TTL)));
        let registrations: Arc<dyn StorageBackend> = match self.registrations {
            Some(store) => store,
            None => Arc::new(MemoryBackend::new()),
        };

        let login_options =
            LoginOptions::from_backends(&self.backends, &self.auth_url_path, &self.registration);
        let started_at = SystemTime::now();

        info!(
            instance_name = self.name.as_str(),
            auth_url_path = self.auth_url_path.as_str(),
            backends = self.backends.len(),
            started_at = started_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            "Provisioned portal instance"
        );

        Ok(Portal {
            name: self.name,
            primary: self.primary,
            auth_url_path: self.auth_url_path,
            ui: self.ui,
            registration: self.registration,
            cookies: self.cookies,
            source_ip_tracking: self.source_ip_tracking,
            realm_policy: self.realm_policy,
            backends: self.backends,
            validator,
            issuer,
            dispatcher,
            sessions,
            registrations,
            login_options,
            started_at,
        })
    }
}

/// An authentication portal mounted at one path prefix.
pub struct Portal {
    name: String,
    primary: bool,
    auth_url_path: String,
    ui: UiConfig,
    registration: RegistrationConfig,
    cookies: CookiePolicy,
    source_ip_tracking: bool,
    realm_policy: RealmMatchPolicy,
    backends: Vec<Arc<dyn Backend>>,
    validator: Arc<dyn TokenValidator>,
    issuer: Arc<dyn TokenIssuer>,
    dispatcher: Arc<dyn ResponseDispatcher>,
    sessions: Arc<SessionCache>,
    registrations: Arc<dyn StorageBackend>,
    login_options: LoginOptions,
    started_at: SystemTime,
}

impl Portal {
    /// Portal name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the primary portal.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Mount path.
    pub fn auth_url_path(&self) -> &str {
        &self.auth_url_path
    }

    /// Page settings.
    pub fn ui(&self) -> &UiConfig {
        &self.ui
    }

    /// Registration settings.
    pub fn registration(&self) -> &RegistrationConfig {
        &self.registration
    }

    /// Store receiving registrations.
    pub fn registrations(&self) -> &Arc<dyn StorageBackend> {
        &self.registrations
    }

    /// Cookie policy.
    pub fn cookies(&self) -> &CookiePolicy {
        &self.cookies
    }

    /// Session token issuer.
    pub fn token_issuer(&self) -> &Arc<dyn TokenIssuer> {
        &self.issuer
    }

    /// Session cache.
    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    /// Login page options.
    pub fn login_options(&self) -> &LoginOptions {
        &self.login_options
    }

    /// Configured backends, in match order.
    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    /// When the portal was provisioned.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Evaluates one request and produces its response.
    pub async fn handle(&self, req: Request<Body>) -> Result<Response, PortalError> {
        let (mut parts, body) = req.into_parts();
        let request_id = request::request_id(&mut parts.extensions);
        let mut ctx = AuthRequest::new(request_id, ContentType::from_headers(&parts.headers));

        // Find session tokens, if any, and validate them.
        match self.validator.authorize(&parts.headers).await {
            Ok(claims) => {
                ctx.authenticated = true;
                ctx.claims = Some(claims);
            },
            Err(AuthError::TokenExpired) => {
                return self
                    .serve(Target::SessionLoginRedirect, &parts, Body::empty(), ctx)
                    .await;
            },
            Err(AuthError::MissingToken) => {},
            Err(e) => {
                warn!(
                    request_id = ctx.request_id.as_str(),
                    src_ip_address = request::source_address(&parts).as_str(),
                    error = %e,
                    "Authorization failed"
                );
            },
        }

        let path = parts.uri.path().to_string();
        let (route, remainder) = classify(&path, &self.auth_url_path);

        // Remember where to return after login, then continue from a clean URL.
        if parts.method == Method::GET {
            let query = request::query_params(&parts.uri);
            if let Some(target) = query.get("redirect_url") {
                ctx.set_cookie(self.cookies.redirect_cookie(target)?);
                if route != Route::Backend {
                    return self.redirect(StatusCode::FOUND, &self.auth_url_path, ctx);
                }
            }
        }

        match route {
            Route::Register => {
                if !self.registration.enabled() {
                    ctx.flow = Some(Flow::UnsupportedFeature);
                    return self.serve(Target::Generic, &parts, Body::empty(), ctx).await;
                }
                ctx.flow = Some(Flow::Register);
                self.serve(Target::Register, &parts, body, ctx).await
            },
            Route::Recover => {
                ctx.flow = Some(Flow::UnsupportedFeature);
                self.serve(Target::Generic, &parts, Body::empty(), ctx).await
            },
            Route::Logout => {
                ctx.flow = Some(Flow::Logout);
                self.serve(Target::SessionLogoff, &parts, Body::empty(), ctx)
                    .await
            },
            Route::Assets => {
                ctx.flow = Some(Flow::Assets);
                self.serve(Target::StaticAssets, &parts, Body::empty(), ctx)
                    .await
            },
            Route::Whoami => {
                ctx.flow = Some(Flow::Whoami);
                self.serve(Target::Whoami, &parts, Body::empty(), ctx).await
            },
            Route::Settings => {
                ctx.flow = Some(Flow::Settings);
                self.serve(Target::Settings, &parts, Body::empty(), ctx).await
            },
            Route::Portal => {
                ctx.flow = Some(Flow::Portal);
                self.serve(Target::Portal, &parts, Body::empty(), ctx).await
            },
            Route::Backend => {
                let remainder = remainder.to_string();
                self.handle_backend(&parts, &remainder, ctx).await
            },
            Route::Login => self.handle_login(&parts, body, ctx).await,
            Route::NotFound => {
                ctx.flow = Some(Flow::NotFound);
                self.serve(Target::Generic, &parts, Body::empty(), ctx).await
            },
        }
    }

    /// Delegated backend endpoint: `{method}/{realm}/...`.
    async fn handle_backend(
        &self,
        parts: &Parts,
        remainder: &str,
        mut ctx: AuthRequest,
    ) -> Result<Response, PortalError> {
        let segments: Vec<&str> = remainder.split('/').collect();
        if segments.len() < 2 {
            ctx.status_code = Some(400);
            ctx.flow = Some(Flow::MalformedBackend);
            ctx.authenticated = false;
            return self.serve(Target::Generic, parts, Body::empty(), ctx).await;
        }
        let (method, realm) = (segments[0], segments[1]);
        ctx.flow = Some(Flow::Backend(method.to_string()));

        let Some(backend) = self
            .backends
            .iter()
            .find(|b| b.realm() == realm && b.method().as_str() == method)
        else {
            ctx.status_code = Some(400);
            ctx.flow = Some(Flow::BackendNotFound);
            ctx.authenticated = false;
            return self.serve(Target::Generic, parts, Body::empty(), ctx).await;
        };

        let query = request::query_params(&parts.uri);
        let base_url = request::base_url(parts);
        let request_path = format!(
            "{}/{}/{}",
            self.auth_url_path.trim_end_matches('/'),
            method,
            realm
        );
        let attempt = AuthAttempt {
            request_id: &ctx.request_id,
            base_url: &base_url,
            request_path: &request_path,
            query: &query,
            headers: &parts.headers,
            credentials: None,
        };

        let outcome = backend.authenticate(&attempt).await;
        let (code, error) = match outcome {
            Ok(AuthOutcome::Authenticated(claims)) => {
                self.establish(parts, &mut ctx, claims, backend.as_ref())
                    .await?;
                return self.serve(Target::Login, parts, Body::empty(), ctx).await;
            },
            // Send the browser to the external identity provider.
            Ok(AuthOutcome::Redirect(location)) => {
                return self.redirect(StatusCode::PERMANENT_REDIRECT, &location, ctx);
            },
            Ok(AuthOutcome::Rejected { code }) => (code, "backend returned no claims".to_string()),
            Err(e) => (e.status_code(), e.to_string()),
        };

        ctx.flow = Some(Flow::AuthFailed);
        ctx.fail(code);
        warn!(
            request_id = ctx.request_id.as_str(),
            auth_method = method,
            auth_realm = realm,
            error = error.as_str(),
            "Authentication failed"
        );
        self.serve(Target::Generic, parts, Body::empty(), ctx).await
    }

    /// Interactive login: the form, or the credentials it submitted.
    async fn handle_login(
        &self,
        parts: &Parts,
        body: Body,
        mut ctx: AuthRequest,
    ) -> Result<Response, PortalError> {
        ctx.flow = Some(Flow::Login);
        if ctx.authenticated {
            ctx.authorized = true;
            return self.serve(Target::Login, parts, Body::empty(), ctx).await;
        }

        match parse_credentials(parts, body).await {
            Ok(Some(credentials)) => {
                ctx.auth_credentials_found = true;
                self.authenticate_credentials(parts, &mut ctx, &credentials)
                    .await?;
                ctx.credentials = Some(credentials);
            },
            Ok(None) => {},
            Err(e) => {
                ctx.message = Some("Authentication failed".to_string());
                ctx.status_code = Some(400);
                warn!(
                    request_id = ctx.request_id.as_str(),
                    error = %e,
                    "Authentication failed"
                );
            },
        }

        self.serve(Target::Login, parts, Body::empty(), ctx).await
    }

    /// Runs every backend serving the credentials' realm under the realm match policy.
    async fn authenticate_credentials(
        &self,
        parts: &Parts,
        ctx: &mut AuthRequest,
        credentials: &Credentials,
    ) -> Result<(), PortalError> {
        let query = request::query_params(&parts.uri);
        let base_url = request::base_url(parts);
        let request_id = ctx.request_id.clone();

        for backend in self
            .backends
            .iter()
            .filter(|b| b.realm() == credentials.realm)
        {
            ctx.auth_backend_found = true;
            let attempt = AuthAttempt {
                request_id: &request_id,
                base_url: &base_url,
                request_path: parts.uri.path(),
                query: &query,
                headers: &parts.headers,
                credentials: Some(credentials),
            };

            let outcome = backend.authenticate(&attempt).await;
            let (code, error) = match outcome {
                Ok(AuthOutcome::Authenticated(claims)) => {
                    self.establish(parts, ctx, claims, backend.as_ref()).await?;
                    if self.realm_policy == RealmMatchPolicy::FirstSuccessWins {
                        break;
                    }
                    continue;
                },
                Ok(AuthOutcome::Redirect(_)) => {
                    (400, "backend requires a redirect flow".to_string())
                },
                Ok(AuthOutcome::Rejected { code }) => {
                    (code, "backend returned no claims".to_string())
                },
                Err(e) => (e.status_code(), e.to_string()),
            };

            ctx.fail(code);
            warn!(
                request_id = request_id.as_str(),
                auth_method = backend.method().as_str(),
                auth_realm = backend.realm(),
                error = error.as_str(),
                "Authentication failed"
            );
        }

        if !ctx.auth_backend_found {
            ctx.status_code = Some(500);
            warn!(
                request_id = request_id.as_str(),
                auth_realm = credentials.realm.as_str(),
                error = "no matching auth backend found",
                "Authentication failed"
            );
        }
        Ok(())
    }

    /// Finalizes backend claims and records the session.
    async fn establish(
        &self,
        parts: &Parts,
        ctx: &mut AuthRequest,
        mut claims: Claims,
        backend: &dyn Backend,
    ) -> Result<(), PortalError> {
        claims.issuer = request::current_url(parts);
        if self.source_ip_tracking {
            claims.address = Some(request::source_address(parts));
        }
        if claims.id.is_empty() {
            claims.id = ctx.request_id.clone();
        }

        self.sessions
            .insert(claims.clone(), backend.identity())
            .await
            .map_err(PortalError::Session)?;

        debug!(
            request_id = ctx.request_id.as_str(),
            auth_method = backend.method().as_str(),
            auth_realm = backend.realm(),
            user = claims.subject.as_str(),
            "Authentication succeeded"
        );

        ctx.authenticated = true;
        ctx.claims = Some(claims);
        ctx.status_code = Some(200);
        ctx.message = None;
        Ok(())
    }

    fn redirect(
        &self,
        status: StatusCode,
        location: &str,
        ctx: AuthRequest,
    ) -> Result<Response, PortalError> {
        let mut response = Response::builder()
            .status(status)
            .header(header::LOCATION, HeaderValue::from_str(location)?)
            .body(Body::empty())?;
        attach_cookies(&mut response, ctx.set_cookies);
        Ok(response)
    }

    async fn serve(
        &self,
        target: Target,
        parts: &Parts,
        body: Body,
        mut ctx: AuthRequest,
    ) -> Result<Response, PortalError> {
        let pending = std::mem::take(&mut ctx.set_cookies);
        let page = Page {
            portal: self,
            parts,
            body,
            ctx,
        };

        let dispatcher = &self.dispatcher;
        let mut response = match target {
            Target::Login => dispatcher.serve_login(page).await,
            Target::Generic => dispatcher.serve_generic(page).await,
            Target::Register => dispatcher.serve_register(page).await,
            Target::SessionLogoff => dispatcher.serve_session_logoff(page).await,
            Target::SessionLoginRedirect => dispatcher.serve_session_login_redirect(page).await,
            Target::StaticAssets => dispatcher.serve_static_assets(page).await,
            Target::Whoami => dispatcher.serve_whoami(page).await,
            Target::Settings => dispatcher.serve_settings(page).await,
            Target::Portal => dispatcher.serve_portal(page).await,
        }?;

        attach_cookies(&mut response, pending);
        Ok(response)
    }
}

fn attach_cookies(response: &mut Response, cookies: Vec<HeaderValue>) {
    for cookie in cookies {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http::HeaderMap;
    use vestibule_auth::AuthMethod;

    use crate::error::DispatchError;
    use crate::request::RequestId;

    enum TokenState {
        Valid(Claims),
        Expired,
        Missing,
        Invalid,
    }

    struct StaticValidator(TokenState);

    #[async_trait]
    impl TokenValidator for StaticValidator {
        async fn authorize(&self, _headers: &HeaderMap) -> Result<Claims, AuthError> {
            match &self.0 {
                TokenState::Valid(claims) => Ok(claims.clone()),
                TokenState::Expired => Err(AuthError::TokenExpired),
                TokenState::Missing => Err(AuthError::MissingToken),
                TokenState::Invalid => Err(AuthError::InvalidToken("bad signature".into())),
            }
        }
    }

    #[derive(Clone)]
    enum Script {
        Succeed(Claims),
        Fail,
        Redirect(&'static str),
        Reject(u16),
    }

    struct MockBackend {
        name: &'static str,
        realm: &'static str,
        method: AuthMethod,
        script: Script,
        calls: AtomicUsize,
    }

    impl MockBackend {
        fn new(
            name: &'static str,
            realm: &'static str,
            method: AuthMethod,
            script: Script,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                realm,
                method,
                script,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn realm(&self) -> &str {
            self.realm
        }

        fn method(&self) -> AuthMethod {
            self.method
        }

        async fn authenticate(&self, _attempt: &AuthAttempt<'_>) -> Result<AuthOutcome, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Succeed(claims) => Ok(AuthOutcome::Authenticated(claims.clone())),
                Script::Fail => Err(AuthError::InvalidCredentials),
                Script::Redirect(url) => Ok(AuthOutcome::Redirect(url.to_string())),
                Script::Reject(code) => Ok(AuthOutcome::Rejected { code: *code }),
            }
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        pages: Mutex<Vec<(&'static str, AuthRequest)>>,
    }

    impl RecordingDispatcher {
        fn last(&self) -> (&'static str, AuthRequest) {
            self.pages.lock().unwrap().last().cloned().expect("no page served")
        }

        fn count(&self) -> usize {
            self.pages.lock().unwrap().len()
        }

        fn record(&self, target: &'static str, page: Page<'_>) -> Result<Response, DispatchError> {
            self.pages.lock().unwrap().push((target, page.ctx));
            Ok(Response::new(Body::empty()))
        }
    }

    #[async_trait]
    impl ResponseDispatcher for RecordingDispatcher {
        async fn serve_login(&self, page: Page<'_>) -> Result<Response, DispatchError> {
            self.record("login", page)
        }
        async fn serve_generic(&self, page: Page<'_>) -> Result<Response, DispatchError> {
            self.record("generic", page)
        }
        async fn serve_register(&self, page: Page<'_>) -> Result<Response, DispatchError> {
            self.record("register", page)
        }
        async fn serve_session_logoff(&self, page: Page<'_>) -> Result<Response, DispatchError> {
            self.record("logoff", page)
        }
        async fn serve_session_login_redirect(
            &self,
            page: Page<'_>,
        ) -> Result<Response, DispatchError> {
            self.record("login_redirect", page)
        }
        async fn serve_static_assets(&self, page: Page<'_>) -> Result<Response, DispatchError> {
            self.record("assets", page)
        }
        async fn serve_whoami(&self, page: Page<'_>) -> Result<Response, DispatchError> {
            self.record("whoami", page)
        }
        async fn serve_settings(&self, page: Page<'_>) -> Result<Response, DispatchError> {
            self.record("settings", page)
        }
        async fn serve_portal(&self, page: Page<'_>) -> Result<Response, DispatchError> {
            self.record("portal", page)
        }
    }

    struct Harness {
        portal: Portal,
        dispatcher: Arc<RecordingDispatcher>,
        sessions: Arc<SessionCache>,
    }

    fn issuer() -> Arc<JwtTokens> {
        Arc::new(JwtTokens::new(JwtConfig {
            token_name: "access_token".into(),
            secret: "portal-test-secret".into(),
            lifetime: Duration::from_secs(300),
        }))
    }

    fn harness(
        token: TokenState,
        policy: RealmMatchPolicy,
        backends: Vec<Arc<dyn Backend>>,
        configure: impl FnOnce(PortalBuilder) -> PortalBuilder,
    ) -> Harness {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let sessions = Arc::new(SessionCache::new(Duration::from_secs(60)));
        let mut builder = PortalBuilder::new("default")
            .realm_match_policy(policy)
            .token_validator(Arc::new(StaticValidator(token)))
            .token_issuer(issuer())
            .dispatcher(dispatcher.clone())
            .sessions(sessions.clone());
        for backend in backends {
            builder = builder.backend(backend);
        }
        Harness {
            portal: configure(builder).build().unwrap(),
            dispatcher,
            sessions,
        }
    }

    fn claims(id: &str, subject: &str) -> Claims {
        let mut claims = Claims::for_subject(subject);
        claims.id = id.to_string();
        claims
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, "gw.example.com")
            .extension(RequestId("req-1".into()))
            .body(Body::empty())
            .unwrap()
    }

    fn login(realm: &str) -> Request<Body> {
        let body = serde_json::json!({
            "username": "alice",
            "password": "secret-password",
            "realm": realm,
        });
        Request::builder()
            .method(Method::POST)
            .uri("/auth/login")
            .header(header::HOST, "gw.example.com")
            .header(header::CONTENT_TYPE, "application/json")
            .extension(RequestId("req-1".into()))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_is_authorized_without_backend() {
        let backend = MockBackend::new("corp", "local", AuthMethod::Local, Script::Fail);
        let h = harness(
            TokenState::Valid(claims("s1", "alice")),
            RealmMatchPolicy::default(),
            vec![backend.clone()],
            |b| b,
        );

        h.portal.handle(login("local")).await.unwrap();

        let (target, ctx) = h.dispatcher.last();
        assert_eq!(target, "login");
        assert!(ctx.authenticated);
        assert!(ctx.authorized);
        assert_eq!(ctx.claims.unwrap().subject, "alice");
        assert!(ctx.credentials.is_none());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_redirects_to_login() {
        let backend = MockBackend::new("corp", "local", AuthMethod::Local, Script::Fail);
        let h = harness(
            TokenState::Expired,
            RealmMatchPolicy::default(),
            vec![backend.clone()],
            |b| b,
        );

        h.portal.handle(login("local")).await.unwrap();

        let (target, ctx) = h.dispatcher.last();
        assert_eq!(target, "login_redirect");
        assert!(!ctx.authenticated);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_anonymous_login_page() {
        for token in [TokenState::Missing, TokenState::Invalid] {
            let h = harness(token, RealmMatchPolicy::default(), Vec::new(), |b| b);

            h.portal.handle(get("/auth")).await.unwrap();

            let (target, ctx) = h.dispatcher.last();
            assert_eq!(target, "login");
            assert!(!ctx.authenticated);
            assert!(!ctx.auth_credentials_found);
            assert_eq!(ctx.flow, Some(Flow::Login));
            assert_eq!(ctx.status_code, None);
            assert_eq!(ctx.request_id, "req-1");
        }
    }

    #[tokio::test]
    async fn test_generated_request_id() {
        let h = harness(TokenState::Missing, RealmMatchPolicy::default(), Vec::new(), |b| b);
        let req = Request::builder()
            .uri("/auth/login")
            .body(Body::empty())
            .unwrap();

        h.portal.handle(req).await.unwrap();

        let (_, ctx) = h.dispatcher.last();
        assert!(uuid::Uuid::parse_str(&ctx.request_id).is_ok());
    }

    #[tokio::test]
    async fn test_malformed_backend_path() {
        let h = harness(TokenState::Missing, RealmMatchPolicy::default(), Vec::new(), |b| b);

        h.portal.handle(get("/auth/oauth2")).await.unwrap();

        let (target, ctx) = h.dispatcher.last();
        assert_eq!(target, "generic");
        assert_eq!(ctx.status_code, Some(400));
        assert_eq!(ctx.flow, Some(Flow::MalformedBackend));
        assert!(!ctx.authenticated);
    }

    #[tokio::test]
    async fn test_backend_not_found() {
        let google = MockBackend::new(
            "google",
            "google",
            AuthMethod::Oauth2,
            Script::Succeed(claims("g1", "alice")),
        );
        let h = harness(
            TokenState::Missing,
            RealmMatchPolicy::default(),
            vec![google.clone()],
            |b| b,
        );

        h.portal.handle(get("/auth/saml/google")).await.unwrap();

        let (target, ctx) = h.dispatcher.last();
        assert_eq!(target, "generic");
        assert_eq!(ctx.status_code, Some(400));
        assert_eq!(ctx.flow, Some(Flow::BackendNotFound));
        assert_eq!(google.calls(), 0);
    }

    #[tokio::test]
    async fn test_delegated_success_uses_request_id_for_empty_claim_id() {
        let google = MockBackend::new(
            "google",
            "google",
            AuthMethod::Oauth2,
            Script::Succeed(claims("", "alice@example.com")),
        );
        let h = harness(
            TokenState::Missing,
            RealmMatchPolicy::default(),
            vec![google.clone()],
            |b| b.source_ip_tracking(true),
        );
        let mut req = get("/auth/oauth2/google/callback?code=abc");
        req.headers_mut()
            .insert("x-real-ip", HeaderValue::from_static("203.0.113.7"));

        h.portal.handle(req).await.unwrap();

        let (target, ctx) = h.dispatcher.last();
        assert_eq!(target, "login");
        assert!(ctx.authenticated);
        assert_eq!(ctx.status_code, Some(200));
        let claims = ctx.claims.unwrap();
        assert_eq!(claims.id, "req-1");
        assert_eq!(claims.issuer, "http://gw.example.com/auth/oauth2/google/callback");
        assert_eq!(claims.address.as_deref(), Some("203.0.113.7"));

        let entry = h.sessions.get("req-1").await.unwrap();
        assert_eq!(entry.backend.name, "google");
        assert_eq!(entry.backend.realm, "google");
        assert_eq!(entry.backend.method, AuthMethod::Oauth2);
    }

    #[tokio::test]
    async fn test_delegated_redirect_is_permanent() {
        let google = MockBackend::new(
            "google",
            "google",
            AuthMethod::Oauth2,
            Script::Redirect("https://accounts.example.com/authorize?state=x"),
        );
        let h = harness(
            TokenState::Missing,
            RealmMatchPolicy::default(),
            vec![google],
            |b| b,
        );

        let response = h.portal.handle(get("/auth/oauth2/google")).await.unwrap();

        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://accounts.example.com/authorize?state=x"
        );
        assert_eq!(h.dispatcher.count(), 0);
        assert!(h.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_delegated_failure() {
        let cert = MockBackend::new("certs", "corp", AuthMethod::X509, Script::Fail);
        let rejecting = MockBackend::new("saml", "corp", AuthMethod::Saml, Script::Reject(403));
        let h = harness(
            TokenState::Missing,
            RealmMatchPolicy::default(),
            vec![cert, rejecting],
            |b| b,
        );

        h.portal.handle(get("/auth/x509/corp")).await.unwrap();
        let (target, ctx) = h.dispatcher.last();
        assert_eq!(target, "generic");
        assert_eq!(ctx.flow, Some(Flow::AuthFailed));
        assert_eq!(ctx.status_code, Some(401));
        assert_eq!(ctx.message.as_deref(), Some("Authentication failed"));
        assert!(!ctx.authenticated);

        h.portal.handle(get("/auth/saml/corp")).await.unwrap();
        let (_, ctx) = h.dispatcher.last();
        assert_eq!(ctx.flow, Some(Flow::AuthFailed));
        assert_eq!(ctx.status_code, Some(403));
        assert!(h.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_last_match_wins_tries_every_backend() {
        let local = MockBackend::new(
            "corp-local",
            "corp",
            AuthMethod::Local,
            Script::Succeed(claims("u1", "alice")),
        );
        let ldap = MockBackend::new("corp-ldap", "corp", AuthMethod::Ldap, Script::Fail);
        let h = harness(
            TokenState::Missing,
            RealmMatchPolicy::LastMatchWins,
            vec![local.clone(), ldap.clone()],
            |b| b,
        );

        h.portal.handle(login("corp")).await.unwrap();

        assert_eq!(local.calls(), 1);
        assert_eq!(ldap.calls(), 1);
        let (target, ctx) = h.dispatcher.last();
        assert_eq!(target, "login");
        assert!(ctx.auth_credentials_found);
        assert!(ctx.auth_backend_found);
        // The later failure only records its status and message.
        assert!(ctx.authenticated);
        assert_eq!(ctx.claims.as_ref().unwrap().subject, "alice");
        assert_eq!(ctx.status_code, Some(401));
        assert_eq!(ctx.message.as_deref(), Some("Authentication failed"));
        assert_eq!(ctx.credentials.unwrap().username, "alice");
        assert_eq!(h.sessions.get("u1").await.unwrap().backend.name, "corp-local");
    }

    #[tokio::test]
    async fn test_last_match_wins_later_success() {
        let ldap = MockBackend::new("corp-ldap", "corp", AuthMethod::Ldap, Script::Fail);
        let local = MockBackend::new(
            "corp-local",
            "corp",
            AuthMethod::Local,
            Script::Succeed(claims("u1", "alice")),
        );
        let h = harness(
            TokenState::Missing,
            RealmMatchPolicy::LastMatchWins,
            vec![ldap.clone(), local.clone()],
            |b| b,
        );

        h.portal.handle(login("corp")).await.unwrap();

        let (_, ctx) = h.dispatcher.last();
        assert!(ctx.authenticated);
        assert_eq!(ctx.status_code, Some(200));
        assert_eq!(ctx.message, None);
        let entry = h.sessions.get("u1").await.unwrap();
        assert_eq!(entry.backend.name, "corp-local");
        assert_eq!(entry.backend.method, AuthMethod::Local);
    }

    #[tokio::test]
    async fn test_first_success_wins_stops_early() {
        let ldap = MockBackend::new("corp-ldap", "corp", AuthMethod::Ldap, Script::Fail);
        let local = MockBackend::new(
            "corp-local",
            "corp",
            AuthMethod::Local,
            Script::Succeed(claims("u1", "alice")),
        );
        let oauth = MockBackend::new(
            "corp-sso",
            "corp",
            AuthMethod::Oauth2,
            Script::Succeed(claims("u2", "mallory")),
        );
        let h = harness(
            TokenState::Missing,
            RealmMatchPolicy::FirstSuccessWins,
            vec![ldap.clone(), local.clone(), oauth.clone()],
            |b| b,
        );

        h.portal.handle(login("corp")).await.unwrap();

        assert_eq!(ldap.calls(), 1);
        assert_eq!(local.calls(), 1);
        assert_eq!(oauth.calls(), 0);
        let (_, ctx) = h.dispatcher.last();
        assert!(ctx.authenticated);
        assert_eq!(ctx.status_code, Some(200));
        assert_eq!(ctx.claims.unwrap().subject, "alice");
        assert_eq!(h.sessions.len().await, 1);
    }

    #[tokio::test]
    async fn test_reauthentication_overwrites_session() {
        let local = MockBackend::new(
            "corp-local",
            "corp",
            AuthMethod::Local,
            Script::Succeed(claims("u1", "alice")),
        );
        let h = harness(
            TokenState::Missing,
            RealmMatchPolicy::default(),
            vec![local],
            |b| b,
        );

        h.portal.handle(login("corp")).await.unwrap();
        h.portal.handle(login("corp")).await.unwrap();

        assert_eq!(h.sessions.len().await, 1);
        assert!(h.sessions.get("u1").await.is_some());
    }

    #[tokio::test]
    async fn test_no_matching_realm() {
        let local = MockBackend::new(
            "corp-local",
            "corp",
            AuthMethod::Local,
            Script::Succeed(claims("u1", "alice")),
        );
        let h = harness(
            TokenState::Missing,
            RealmMatchPolicy::default(),
            vec![local.clone()],
            |b| b,
        );

        h.portal.handle(login("partners")).await.unwrap();

        let (target, ctx) = h.dispatcher.last();
        assert_eq!(target, "login");
        assert!(ctx.auth_credentials_found);
        assert!(!ctx.auth_backend_found);
        assert_eq!(ctx.status_code, Some(500));
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_credentials() {
        let h = harness(TokenState::Missing, RealmMatchPolicy::default(), Vec::new(), |b| b);
        let req = Request::builder()
            .method(Method::POST)
            .uri("/auth/login")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("alice:secret"))
            .unwrap();

        h.portal.handle(req).await.unwrap();

        let (target, ctx) = h.dispatcher.last();
        assert_eq!(target, "login");
        assert_eq!(ctx.status_code, Some(400));
        assert_eq!(ctx.message.as_deref(), Some("Authentication failed"));
        assert!(!ctx.auth_credentials_found);
    }

    #[tokio::test]
    async fn test_redirect_url_is_remembered() {
        let h = harness(TokenState::Missing, RealmMatchPolicy::default(), Vec::new(), |b| b);

        let response = h
            .portal
            .handle(get("/auth/login?redirect_url=%2Fapp%2Fhome"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/auth");
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("AUTH_PORTAL_REDIRECT_URL=%2Fapp%2Fhome;"));
        assert_eq!(h.dispatcher.count(), 0);
    }

    #[tokio::test]
    async fn test_redirect_url_on_backend_path_continues() {
        let google = MockBackend::new(
            "google",
            "google",
            AuthMethod::Oauth2,
            Script::Redirect("https://accounts.example.com/authorize"),
        );
        let h = harness(
            TokenState::Missing,
            RealmMatchPolicy::default(),
            vec![google.clone()],
            |b| b,
        );

        let response = h
            .portal
            .handle(get("/auth/oauth2/google?redirect_url=%2Fapp"))
            .await
            .unwrap();

        assert_eq!(google.calls(), 1);
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert!(response.headers().get(header::SET_COOKIE).is_some());
    }

    #[tokio::test]
    async fn test_static_flows() {
        let h = harness(TokenState::Missing, RealmMatchPolicy::default(), Vec::new(), |b| b);
        let cases = [
            ("/auth/register", "generic", Flow::UnsupportedFeature),
            ("/auth/forgot", "generic", Flow::UnsupportedFeature),
            ("/auth/recover", "generic", Flow::UnsupportedFeature),
            ("/auth/logout", "logoff", Flow::Logout),
            ("/auth/logoff", "logoff", Flow::Logout),
            ("/auth/assets/app.css", "assets", Flow::Assets),
            ("/auth/whoami", "whoami", Flow::Whoami),
            ("/auth/settings", "settings", Flow::Settings),
            ("/auth/portal", "portal", Flow::Portal),
            ("/auth/unknown", "generic", Flow::NotFound),
        ];

        for (path, expected_target, expected_flow) in cases {
            h.portal.handle(get(path)).await.unwrap();
            let (target, ctx) = h.dispatcher.last();
            assert_eq!(target, expected_target, "{}", path);
            assert_eq!(ctx.flow, Some(expected_flow), "{}", path);
        }
    }

    #[tokio::test]
    async fn test_registration_enabled() {
        let h = harness(TokenState::Missing, RealmMatchPolicy::default(), Vec::new(), |b| {
            b.registration(RegistrationConfig {
                dropbox: "registrations".into(),
                ..RegistrationConfig::default()
            })
        });
        assert!(h.portal.login_options().registration_enabled);

        h.portal.handle(get("/auth/register")).await.unwrap();

        let (target, ctx) = h.dispatcher.last();
        assert_eq!(target, "register");
        assert_eq!(ctx.flow, Some(Flow::Register));
    }

    #[test]
    fn test_duplicate_backend_address_rejected() {
        let result = PortalBuilder::new("default")
            .tokens(issuer())
            .backend(MockBackend::new("a", "corp", AuthMethod::Ldap, Script::Fail))
            .backend(MockBackend::new("b", "corp", AuthMethod::Ldap, Script::Fail))
            .build();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_validator_rejected() {
        let result = PortalBuilder::new("default").build();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_login_options() {
        let h = harness(
            TokenState::Missing,
            RealmMatchPolicy::default(),
            vec![
                MockBackend::new("local", "local", AuthMethod::Local, Script::Fail),
                MockBackend::new("corp", "corp", AuthMethod::Ldap, Script::Fail),
                MockBackend::new("corp-local", "corp", AuthMethod::Local, Script::Fail),
                MockBackend::new("google", "google", AuthMethod::Oauth2, Script::Fail),
            ],
            |b| b,
        );

        let options = h.portal.login_options();
        let realms: Vec<_> = options.form_realms.iter().map(|r| r.realm.as_str()).collect();
        assert_eq!(realms, vec!["local", "corp"]);
        assert_eq!(options.external_logins.len(), 1);
        assert_eq!(options.external_logins[0].path, "/auth/oauth2/google");
        assert!(!options.registration_enabled);
    }
}
