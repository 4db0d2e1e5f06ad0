//! Session and OIDC flow persistence
//!
//! Two small traits, [`SessionStore`] and [`FlowStore`], each with an
//! in-process [`memory`] backend and a shared [`redis`] backend. The backend
//! is chosen once at startup by [`connect_stores`]; call sites only ever see
//! `Arc<dyn _>`.
//!
//! Both backends enforce record TTLs themselves. An expired record is
//! indistinguishable from one that never existed.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use crate::config::{ConfigError, StoreBackend, StoreConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use memory::{MemoryFlowStore, MemorySessionStore};
#[cfg(feature = "redis")]
pub use self::redis::{RedisFlowStore, RedisSessionStore};

/// Lifetime of an in-progress OIDC login
pub const FLOW_TTL: Duration = Duration::from_secs(10 * 60);

/// Server-side record backing one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Random id, also sealed into the session cookie.
    pub session_id: String,
    /// Owner of the session.
    pub customer_id: String,
    /// `User-Agent` seen when the record was written.
    pub user_agent: String,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

/// Server-side state for an in-progress OIDC login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcFlowRecord {
    /// OAuth `state`, also the store key.
    pub state: String,
    /// ID token nonce.
    pub nonce: String,
    /// PKCE verifier.
    pub code_verifier: String,
    /// Redirect URI used in the authorization request.
    pub redirect_uri: String,
    /// Relative path to return to after login.
    pub return_to: String,
    /// Id bound to the browser that started the flow.
    pub flow_id: String,
    /// When the flow started.
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for OidcFlowRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcFlowRecord")
            .field("state", &self.state)
            .field("nonce", &"[redacted]")
            .field("code_verifier", &"[redacted]")
            .field("redirect_uri", &self.redirect_uri)
            .field("return_to", &self.return_to)
            .field("flow_id", &"[redacted]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Store failures. Never masked as "not found".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No connection could be checked out of the pool.
    #[cfg(feature = "redis")]
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// A redis command failed.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// A record could not be encoded or decoded.
    #[error("failed to (de)serialize stored record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistence for [`SessionRecord`]s, keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a live record.
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Insert or replace a record that expires after `ttl`.
    async fn set(&self, record: &SessionRecord, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a record. Returns whether a live record was removed.
    async fn delete(&self, session_id: &str) -> Result<bool, StoreError>;

    /// All live records of a customer, newest first.
    async fn list(&self, customer_id: &str) -> Result<Vec<SessionRecord>, StoreError>;
}

/// Persistence for [`OidcFlowRecord`]s, keyed by `state`. Records expire
/// after [`FLOW_TTL`].
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert or replace a flow.
    async fn set(&self, record: &OidcFlowRecord) -> Result<(), StoreError>;

    /// Fetch a live flow without consuming it.
    async fn get(&self, state: &str) -> Result<Option<OidcFlowRecord>, StoreError>;

    /// Remove a flow. Returns whether a live flow was removed.
    async fn delete(&self, state: &str) -> Result<bool, StoreError>;

    /// Fetch and remove a flow in one atomic step.
    ///
    /// Of several concurrent callers with the same `state`, at most one
    /// receives the record.
    async fn take(&self, state: &str) -> Result<Option<OidcFlowRecord>, StoreError>;
}

/// The pair of stores used by the auth core.
#[derive(Clone)]
pub struct Stores {
    /// Session records.
    pub sessions: Arc<dyn SessionStore>,
    /// OIDC flow records.
    pub flows: Arc<dyn FlowStore>,
}

impl Stores {
    /// In-process stores without a cleanup task.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            sessions: Arc::new(MemorySessionStore::new()),
            flows: Arc::new(MemoryFlowStore::new()),
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// Build the stores selected by configuration.
///
/// The memory backend gets a periodic purge task when called inside a tokio
/// runtime. The redis pool connects lazily, so this never touches the
/// network.
///
/// # Errors
///
/// Returns an error if redis is selected but not configured, not compiled
/// in, or the pool cannot be created.
pub fn connect_stores(config: &StoreConfig) -> Result<Stores, ConfigError> {
    match config.resolved_backend() {
        StoreBackend::Memory => {
            tracing::info!(
                "Using in-memory session store; sessions are not shared between instances"
            );
            let sessions = Arc::new(MemorySessionStore::new());
            let flows = Arc::new(MemoryFlowStore::new());
            if tokio::runtime::Handle::try_current().is_ok() {
                let interval = config.cleanup_interval();
                memory::spawn_cleanup_task(&sessions, interval);
                memory::spawn_cleanup_task(&flows, interval);
            }
            Ok(Stores { sessions, flows })
        }
        StoreBackend::Redis => connect_redis(config),
    }
}

#[cfg(feature = "redis")]
fn connect_redis(config: &StoreConfig) -> Result<Stores, ConfigError> {
    let url = config.redis_connection_url()?;
    let pool = deadpool_redis::Config::from_url(url)
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
    tracing::info!(key_prefix = %config.key_prefix, "Using redis session store");
    Ok(Stores {
        sessions: Arc::new(RedisSessionStore::new(pool.clone(), &config.key_prefix)),
        flows: Arc::new(RedisFlowStore::new(pool, &config.key_prefix)),
    })
}

#[cfg(not(feature = "redis"))]
fn connect_redis(_config: &StoreConfig) -> Result<Stores, ConfigError> {
    Err(ConfigError::RedisUnavailable)
}
