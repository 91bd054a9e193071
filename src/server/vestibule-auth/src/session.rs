//! In-memory cache of established sessions.
//!
//! Entries are keyed by claim id and live for a fixed TTL. Expired entries are
//! invisible to readers immediately and are dropped by [`SessionCache::purge_expired`],
//! which the sweeper task runs periodically.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::{AuthError, BackendIdentity, Claims};

/// A cached session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// Claims issued for the session.
    pub claims: Claims,
    /// Backend that authenticated the subject.
    pub backend: BackendIdentity,
    /// When the entry was written.
    pub created_at: Instant,
}

/// Concurrency-safe session store with per-entry TTL.
pub struct SessionCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionCache {
    /// Creates an empty cache whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores a session under its claim id, replacing any previous entry for that id.
    pub async fn insert(&self, claims: Claims, backend: BackendIdentity) -> Result<(), AuthError> {
        if claims.id.is_empty() {
            return Err(AuthError::MalformedRequest(
                "session claims have no identifier".into(),
            ));
        }

        let key = claims.id.clone();
        let entry = SessionEntry {
            claims,
            backend,
            created_at: Instant::now(),
        };
        self.entries.write().await.insert(key, entry);
        Ok(())
    }

    /// Returns the live entry for `id`.
    pub async fn get(&self, id: &str) -> Option<SessionEntry> {
        let entries = self.entries.read().await;
        entries
            .get(id)
            .filter(|entry| !self.is_expired(entry))
            .cloned()
    }

    /// Removes the entry for `id`, returning it if it was still live.
    pub async fn remove(&self, id: &str) -> Option<SessionEntry> {
        let removed = self.entries.write().await.remove(id);
        removed.filter(|entry| !self.is_expired(entry))
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drops expired entries and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        before - entries.len()
    }

    /// Spawns a task purging expired entries every `period`.
    ///
    /// The task holds a weak reference and stops once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    debug!(purged = purged, "Expired sessions purged");
                }
            }
        })
    }

    fn is_expired(&self, entry: &SessionEntry) -> bool {
        entry.created_at.elapsed() >= self.ttl
    }
}
