//! # Vestibule Portal
//!
//! Request routing and authentication orchestration for the Vestibule gateway.
//!
//! ## Flows
//!
//! - `{mount}` or `{mount}/login` - Interactive login
//! - `{mount}/{oauth2,saml,x509}/{realm}` - Delegated backends
//! - `{mount}/register` - Self-service registration
//! - `{mount}/logout` - Session termination
//! - `{mount}/whoami`, `{mount}/settings`, `{mount}/portal` - Session pages

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod cookies;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod flow;
pub mod portal;
pub mod registry;
pub mod render;
pub mod request;
pub mod router;

pub use config::{GatewayConfig, PortalConfig, RealmMatchPolicy};
pub use context::AuthRequest;
pub use cookies::{CookiePolicy, REDIRECT_COOKIE};
pub use dispatcher::{Page, ResponseDispatcher};
pub use error::{ConfigError, CredentialsError, DispatchError, PortalError, RegistryError};
pub use flow::{classify, Flow, Route};
pub use portal::{LoginOptions, Portal, PortalBuilder};
pub use registry::PortalRegistry;
pub use render::DefaultDispatcher;
pub use request::RequestId;
pub use router::router;
