//! Local users authentication backend.
//!
//! Validates username/password credentials against Argon2id hashes held in
//! configuration.

use std::collections::HashMap;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{AuthAttempt, AuthError, AuthMethod, AuthOutcome, Backend, Claims};

/// A locally defined user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalUser {
    /// Login name.
    pub username: String,
    /// Argon2id PHC string.
    pub password_hash: String,
    /// Email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Roles granted on login.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Authentication backend for locally defined users.
pub struct LocalBackend {
    name: String,
    realm: String,
    users: HashMap<String, LocalUser>,
}

impl LocalBackend {
    /// Creates a new local backend.
    ///
    /// # Arguments
    ///
    /// * `name` - Operator-assigned backend name
    /// * `realm` - Realm the login form must select
    /// * `users` - Users with their Argon2id password hashes
    pub fn new(name: impl Into<String>, realm: impl Into<String>, users: Vec<LocalUser>) -> Self {
        Self {
            name: name.into(),
            realm: realm.into(),
            users: users
                .into_iter()
                .map(|user| (user.username.clone(), user))
                .collect(),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn method(&self) -> AuthMethod {
        AuthMethod::Local
    }

    async fn authenticate(&self, attempt: &AuthAttempt<'_>) -> Result<AuthOutcome, AuthError> {
        let credentials = attempt
            .credentials
            .ok_or_else(|| AuthError::MalformedRequest("no credentials submitted".into()))?;

        let user = self
            .users
            .get(&credentials.username)
            .ok_or(AuthError::InvalidCredentials)?;

        // Parse the hash
        let parsed_hash = PasswordHash::new(&user.password_hash).map_err(|_| {
            AuthError::Configuration(format!("invalid password hash for {}", user.username))
        })?;

        // Verify with Argon2id
        let valid = Argon2::default()
            .verify_password(credentials.password.as_bytes(), &parsed_hash)
            .is_ok();

        if !valid {
            return Err(AuthError::InvalidCredentials);
        }

        let claims = Claims {
            subject: user.username.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            roles: user.roles.clone(),
            ..Claims::default()
        };
        Ok(AuthOutcome::Authenticated(
            claims.with_origin(AuthMethod::Local, &self.realm),
        ))
    }
}
