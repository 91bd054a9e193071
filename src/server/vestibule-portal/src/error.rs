//! Portal error types.

use std::path::PathBuf;

use thiserror::Error;
use vestibule_auth::AuthError;
use vestibule_storage::StorageError;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Configuration document is not valid JSON for the expected shape.
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    /// Configuration is well-formed but violates a constraint.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A backend could not be constructed.
    #[error("backend {name}: {source}")]
    Backend {
        /// Backend name.
        name: String,
        /// Underlying error.
        source: AuthError,
    },

    /// Portals could not be registered together.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors raised while reading credentials from a request.
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// Body could not be read.
    #[error("failed to read request body: {0}")]
    Body(String),

    /// Body is not in a supported encoding.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Body could not be decoded.
    #[error("malformed credentials: {0}")]
    Malformed(String),

    /// A required field is absent or empty.
    #[error("required field missing: {0}")]
    MissingField(&'static str),
}

/// Errors raised by a response dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Session token could not be issued.
    #[error("token error: {0}")]
    Token(#[from] AuthError),

    /// Registration store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Response could not be assembled.
    #[error("http error: {0}")]
    Http(#[from] http::Error),

    /// Header value could not be encoded.
    #[error("invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),
}

/// Errors propagated to the host for generic handling.
#[derive(Debug, Error)]
pub enum PortalError {
    /// Portal could not be built from its configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Response dispatcher failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Session could not be recorded.
    #[error("session error: {0}")]
    Session(AuthError),

    /// Response could not be assembled.
    #[error("http error: {0}")]
    Http(#[from] http::Error),

    /// Header value could not be encoded.
    #[error("invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),
}

/// Errors raised by the portal registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A portal with this name is already registered.
    #[error("portal already registered: {0}")]
    Duplicate(String),

    /// Another portal already serves this mount path.
    #[error("mount path {path} already served by portal {owner}")]
    DuplicateMount {
        /// Contested path.
        path: String,
        /// Portal already mounted there.
        owner: String,
    },

    /// A primary portal is already registered.
    #[error("primary portal already registered: {0}")]
    DuplicatePrimary(String),

    /// No portal with this name is registered.
    #[error("portal not found: {0}")]
    NotFound(String),
}
