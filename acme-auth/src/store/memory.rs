//! In-process store backends
//!
//! Backed by [`DashMap`] with per-entry deadlines. Expired entries are
//! treated as absent on read and removed by [`PurgeExpired::purge_expired`],
//! which [`spawn_cleanup_task`] runs on an interval.
//!
//! Only safe within a single process. Deployments with more than one
//! instance need the redis backend.

use super::{FlowStore, OidcFlowRecord, SessionRecord, SessionStore, StoreError, FLOW_TTL};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Backends that can drop their expired entries in bulk.
pub trait PurgeExpired: Send + Sync + 'static {
    /// Remove expired entries. Returns how many were removed.
    fn purge_expired(&self) -> usize;
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    /// `None` when the TTL is too large to represent.
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// String-keyed map whose entries vanish after their TTL.
#[derive(Debug)]
struct ExpiringMap<V> {
    entries: DashMap<String, Entry<V>>,
}

impl<V: Clone> ExpiringMap<V> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn get(&self, key: &str) -> Option<V> {
        // The shard guard must be released before removing from the same shard.
        let lookup = self
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired()).then(|| entry.value.clone()));
        match lookup {
            Some(Some(value)) => Some(value),
            Some(None) => {
                self.entries.remove_if(key, |_, entry| entry.is_expired());
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: String, value: V, ttl: Duration) {
        self.entries.insert(key, Entry::new(value, ttl));
    }

    fn remove(&self, key: &str) -> Option<V> {
        self.entries
            .remove(key)
            .and_then(|(_, entry)| (!entry.is_expired()).then_some(entry.value))
    }

    fn live_values(&self, mut keep: impl FnMut(&V) -> bool) -> Vec<V> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired() && keep(&entry.value))
            .map(|entry| entry.value.clone())
            .collect()
    }

    fn purge(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// In-process [`SessionStore`].
#[derive(Debug)]
pub struct MemorySessionStore {
    sessions: ExpiringMap<SessionRecord>,
}

impl MemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: ExpiringMap::new(),
        }
    }

    /// Number of stored entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PurgeExpired for MemorySessionStore {
    fn purge_expired(&self) -> usize {
        self.sessions.purge()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.get(session_id))
    }

    async fn set(&self, record: &SessionRecord, ttl: Duration) -> Result<(), StoreError> {
        self.sessions
            .insert(record.session_id.clone(), record.clone(), ttl);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.remove(session_id).is_some())
    }

    async fn list(&self, customer_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let mut records = self
            .sessions
            .live_values(|record| record.customer_id == customer_id);
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

/// In-process [`FlowStore`].
#[derive(Debug)]
pub struct MemoryFlowStore {
    flows: ExpiringMap<OidcFlowRecord>,
    ttl: Duration,
}

impl MemoryFlowStore {
    /// Create an empty store using [`FLOW_TTL`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(FLOW_TTL)
    }

    /// Create an empty store with a custom flow lifetime.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            flows: ExpiringMap::new(),
            ttl,
        }
    }
}

impl Default for MemoryFlowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PurgeExpired for MemoryFlowStore {
    fn purge_expired(&self) -> usize {
        self.flows.purge()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn set(&self, record: &OidcFlowRecord) -> Result<(), StoreError> {
        self.flows
            .insert(record.state.clone(), record.clone(), self.ttl);
        Ok(())
    }

    async fn get(&self, state: &str) -> Result<Option<OidcFlowRecord>, StoreError> {
        Ok(self.flows.get(state))
    }

    async fn delete(&self, state: &str) -> Result<bool, StoreError> {
        Ok(self.flows.remove(state).is_some())
    }

    async fn take(&self, state: &str) -> Result<Option<OidcFlowRecord>, StoreError> {
        Ok(self.flows.remove(state))
    }
}

/// Spawn the periodic purge task for a memory backend.
///
/// The task holds a weak reference and exits once the store is dropped.
pub fn spawn_cleanup_task<S: PurgeExpired>(store: &Arc<S>, interval: Duration) -> JoinHandle<()> {
    let store = Arc::downgrade(store);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                break;
            };
            let removed = store.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, "Purged expired store entries");
            }
        }
    })
}
