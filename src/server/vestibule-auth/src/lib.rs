//! # Vestibule Auth
//!
//! Authentication primitives for the Vestibule gateway.
//!
//! ## Contents
//!
//! - [`Backend`] trait and the built-in local, OAuth 2.0 and X.509 backends
//! - [`TokenValidator`] trait and HS256 session tokens
//! - [`SessionCache`] of established sessions

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod context;
pub mod error;
pub mod local;
pub mod oauth2;
pub mod session;
pub mod token;
pub mod x509;

pub use backend::{AuthAttempt, AuthOutcome, Backend};
pub use context::{AuthMethod, BackendIdentity, Claims, Credentials};
pub use error::AuthError;
pub use local::{LocalBackend, LocalUser};
pub use oauth2::{OAuth2Backend, OAuth2Config};
pub use session::{SessionCache, SessionEntry};
pub use token::{cookie_value, JwtConfig, JwtTokens, TokenIssuer, TokenValidator};
pub use x509::{X509Backend, X509Config};
