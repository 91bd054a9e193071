//! Portal registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;
use vestibule_auth::SessionCache;

use crate::config::GatewayConfig;
use crate::error::{ConfigError, RegistryError};
use crate::portal::{Portal, PortalBuilder};

/// Portals hosted by one gateway, keyed by name.
#[derive(Default)]
pub struct PortalRegistry {
    portals: BTreeMap<String, Arc<Portal>>,
}

impl PortalRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and registers every portal of a gateway configuration.
    ///
    /// All portals share `sessions`.
    pub fn from_config(
        config: &GatewayConfig,
        sessions: Arc<SessionCache>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut registry = Self::new();
        for portal in &config.portals {
            let portal = PortalBuilder::from_config(portal)?
                .sessions(Arc::clone(&sessions))
                .build()?;
            registry.register(portal)?;
        }
        Ok(registry)
    }

    /// Adds a portal.
    ///
    /// # Errors
    ///
    /// Fails when the name or mount path is taken, or when a second primary
    /// portal is registered.
    pub fn register(&mut self, portal: Portal) -> Result<Arc<Portal>, RegistryError> {
        if self.portals.contains_key(portal.name()) {
            return Err(RegistryError::Duplicate(portal.name().to_string()));
        }
        let mount = portal.auth_url_path().trim_end_matches('/');
        if let Some(owner) = self
            .portals
            .values()
            .find(|p| p.auth_url_path().trim_end_matches('/') == mount)
        {
            return Err(RegistryError::DuplicateMount {
                path: portal.auth_url_path().to_string(),
                owner: owner.name().to_string(),
            });
        }
        if portal.is_primary() {
            if let Some(primary) = self.primary() {
                return Err(RegistryError::DuplicatePrimary(primary.name().to_string()));
            }
        }

        info!(
            instance_name = portal.name(),
            auth_url_path = portal.auth_url_path(),
            primary = portal.is_primary(),
            "Registered portal instance"
        );
        let portal = Arc::new(portal);
        self.portals
            .insert(portal.name().to_string(), Arc::clone(&portal));
        Ok(portal)
    }

    /// Looks up a portal by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<Portal>, RegistryError> {
        self.portals
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// The primary portal, if one is registered.
    pub fn primary(&self) -> Option<Arc<Portal>> {
        self.portals.values().find(|p| p.is_primary()).cloned()
    }

    /// Registered portals in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Portal>> {
        self.portals.values()
    }

    /// Number of registered portals.
    pub fn len(&self) -> usize {
        self.portals.len()
    }

    /// Returns true if no portal is registered.
    pub fn is_empty(&self) -> bool {
        self.portals.is_empty()
    }
}
