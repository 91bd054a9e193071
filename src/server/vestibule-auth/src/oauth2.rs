//! OAuth 2.0 authorization-code backend.
//!
//! The first request to `{auth_url_path}/oauth2/{realm}` is answered with a
//! redirect to the provider. The provider sends the browser back to the same
//! path with `code` and `state`, which are exchanged for an access token and
//! the provider's userinfo document.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::{AuthAttempt, AuthError, AuthMethod, AuthOutcome, Backend, Claims};

/// How long an issued `state` value may be redeemed.
const STATE_TTL: Duration = Duration::from_secs(600);

/// Outstanding `state` values kept per backend. The oldest is evicted first.
const MAX_PENDING_STATES: usize = 1024;

/// Configuration for an OAuth 2.0 provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Config {
    /// Client identifier registered with the provider.
    pub client_id: String,
    /// Client secret registered with the provider.
    pub client_secret: String,
    /// Authorization endpoint.
    pub authorization_url: String,
    /// Token endpoint.
    pub token_url: String,
    /// Userinfo endpoint.
    pub userinfo_url: String,
    /// Requested scopes.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Timeout for calls to the provider, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".into(), "email".into(), "profile".into()]
}

fn default_timeout_secs() -> u64 {
    10
}

/// Outstanding `state` values, oldest first.
#[derive(Default)]
struct PendingStates {
    issued: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl PendingStates {
    fn insert(&mut self, state: String) {
        while let Some(oldest) = self.order.front() {
            let expired = self
                .issued
                .get(oldest)
                .map_or(true, |issued| issued.elapsed() >= STATE_TTL);
            if !expired && self.order.len() < MAX_PENDING_STATES {
                break;
            }
            if let Some(oldest) = self.order.pop_front() {
                self.issued.remove(&oldest);
            }
        }
        self.issued.insert(state.clone(), Instant::now());
        self.order.push_back(state);
    }

    fn redeem(&mut self, state: &str) -> bool {
        matches!(self.issued.remove(state), Some(issued) if issued.elapsed() < STATE_TTL)
    }

    fn len(&self) -> usize {
        self.issued.len()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Authentication backend for an OAuth 2.0 identity provider.
pub struct OAuth2Backend {
    name: String,
    realm: String,
    config: OAuth2Config,
    http: reqwest::Client,
    pending: Mutex<PendingStates>,
}

impl OAuth2Backend {
    /// Creates a new OAuth 2.0 backend.
    pub fn new(
        name: impl Into<String>,
        realm: impl Into<String>,
        config: OAuth2Config,
    ) -> Result<Self, AuthError> {
        Url::parse(&config.authorization_url)
            .map_err(|e| AuthError::Configuration(format!("authorization_url: {}", e)))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AuthError::Configuration(format!("http client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            realm: realm.into(),
            config,
            http,
            pending: Mutex::new(PendingStates::default()),
        })
    }

    fn issue_state(&self) -> Result<String, AuthError> {
        let state = Uuid::new_v4().to_string();
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| AuthError::Configuration("oauth2 state store poisoned".into()))?;
        pending.insert(state.clone());
        Ok(state)
    }

    fn redeem_state(&self, state: &str) -> Result<(), AuthError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| AuthError::Configuration("oauth2 state store poisoned".into()))?;
        if pending.redeem(state) {
            Ok(())
        } else {
            Err(AuthError::MalformedRequest(
                "unknown or expired oauth2 state".into(),
            ))
        }
    }

    fn authorization_redirect(&self, attempt: &AuthAttempt<'_>) -> Result<String, AuthError> {
        let state = self.issue_state()?;
        let scope = self.config.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.config.authorization_url,
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", attempt.callback_url().as_str()),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| AuthError::Configuration(format!("authorization_url: {}", e)))?;
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<String, AuthError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Upstream(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AuthError::Upstream(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Upstream(format!("invalid token response: {}", e)))?;
        Ok(token.access_token)
    }

    async fn fetch_userinfo(
        &self,
        access_token: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, AuthError> {
        let response = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AuthError::Upstream(format!("userinfo request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AuthError::Upstream(format!(
                "userinfo endpoint returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::Upstream(format!("invalid userinfo response: {}", e)))
    }

    fn claims_from_userinfo(
        &self,
        mut info: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Claims, AuthError> {
        // Providers disagree on the subject field and on its type.
        let subject = ["sub", "id", "login"]
            .iter()
            .find_map(|key| match info.remove(*key) {
                Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
                Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| AuthError::Upstream("userinfo has no subject".into()))?;

        let take_string = |info: &mut serde_json::Map<String, serde_json::Value>, key: &str| {
            match info.remove(key) {
                Some(serde_json::Value::String(s)) => Some(s),
                _ => None,
            }
        };
        let email = take_string(&mut info, "email");
        let name = take_string(&mut info, "name");

        let claims = Claims {
            subject,
            email,
            name,
            extra: info.into_iter().collect(),
            ..Claims::default()
        };
        Ok(claims.with_origin(AuthMethod::Oauth2, &self.realm))
    }
}

#[async_trait]
impl Backend for OAuth2Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn method(&self) -> AuthMethod {
        AuthMethod::Oauth2
    }

    async fn authenticate(&self, attempt: &AuthAttempt<'_>) -> Result<AuthOutcome, AuthError> {
        if let Some(error) = attempt.query.get("error") {
            debug!(
                request_id = attempt.request_id,
                provider_error = error.as_str(),
                "Identity provider denied authorization"
            );
            return Err(AuthError::InvalidCredentials);
        }

        let Some(code) = attempt.query.get("code") else {
            return self.authorization_redirect(attempt).map(AuthOutcome::Redirect);
        };

        let state = attempt
            .query
            .get("state")
            .ok_or_else(|| AuthError::MalformedRequest("missing oauth2 state".into()))?;
        self.redeem_state(state)?;

        let access_token = self.exchange_code(code, &attempt.callback_url()).await?;
        let info = self.fetch_userinfo(&access_token).await?;
        self.claims_from_userinfo(info).map(AuthOutcome::Authenticated)
    }
}
