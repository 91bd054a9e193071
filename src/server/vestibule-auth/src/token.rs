//! Session token validation and issuance.
//!
//! Session tokens are HS256-signed JWTs carrying [`Claims`]. They are read from
//! the session cookie first and from an `Authorization: Bearer` header second.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http::{header, HeaderMap};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::{AuthError, Claims};

/// Verifies the session token presented with a request.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns the claims of a valid token.
    ///
    /// # Returns
    ///
    /// * `Ok(Claims)` - If a token is present and valid
    /// * `Err(AuthError::MissingToken)` - If no token is presented
    /// * `Err(AuthError::TokenExpired)` - If the token is past its expiry
    /// * `Err(_)` - Any other verification failure
    async fn authorize(&self, headers: &HeaderMap) -> Result<Claims, AuthError>;
}

/// Issues session tokens for authenticated subjects.
pub trait TokenIssuer: Send + Sync {
    /// Name of the cookie carrying the token.
    fn token_name(&self) -> &str;

    /// Token lifetime.
    fn lifetime(&self) -> Duration;

    /// Signs the claims into a session token.
    fn issue(&self, claims: &Claims) -> Result<String, AuthError>;
}

/// Configuration for JWT session tokens.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Cookie carrying the token.
    pub token_name: String,
    /// HMAC signing secret.
    pub secret: String,
    /// Token lifetime.
    pub lifetime: Duration,
}

/// HS256 session token validator and issuer.
pub struct JwtTokens {
    token_name: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    lifetime: Duration,
}

impl JwtTokens {
    /// Creates a validator/issuer pair sharing one secret.
    pub fn new(config: JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            token_name: config.token_name,
            validation,
            lifetime: config.lifetime,
        }
    }

    fn extract(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(value) = cookie_value(headers, &self.token_name) {
            return Some(value);
        }
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

impl TokenIssuer for JwtTokens {
    fn token_name(&self) -> &str {
        &self.token_name
    }

    fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Stamps `iat` and `exp` before signing.
    fn issue(&self, claims: &Claims) -> Result<String, AuthError> {
        let now = unix_now();
        let mut claims = claims.clone();
        claims.issued_at = Some(now);
        claims.expires_at = Some(now + self.lifetime.as_secs());

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Configuration(format!("token signing failed: {}", e)))
    }
}

#[async_trait]
impl TokenValidator for JwtTokens {
    async fn authorize(&self, headers: &HeaderMap) -> Result<Claims, AuthError> {
        let token = self.extract(headers).ok_or(AuthError::MissingToken)?;

        let token_data = decode::<Claims>(&token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidCredentials,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;

        Ok(token_data.claims)
    }
}

/// Returns the value of the named cookie from the `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
