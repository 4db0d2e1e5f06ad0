//! Redis store backends
//!
//! Records are stored as JSON strings with native key expiry. Session ids of
//! each customer are indexed in a set so that [`SessionStore::list`] does not
//! need to scan the keyspace.
//!
//! Key layout:
//!
//! ```text
//! <prefix>:session:<sessionId>            -> SessionRecord JSON, EX ttl
//! <prefix>:customer_sessions:<customerId> -> SET of sessionId
//! <prefix>:oidc_flow:<state>              -> OidcFlowRecord JSON, EX 600
//! ```

use super::{FlowStore, OidcFlowRecord, SessionRecord, SessionStore, StoreError, FLOW_TTL};
use ::redis::AsyncCommands;
use async_trait::async_trait;
use deadpool_redis::Pool;
use std::time::Duration;
use tracing::debug;

/// Redis EX arguments must be at least one second.
fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn decode<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>, StoreError> {
    raw.map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(StoreError::from)
}

/// Redis-backed [`SessionStore`].
#[derive(Clone)]
pub struct RedisSessionStore {
    pool: Pool,
    prefix: String,
}

impl RedisSessionStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub fn new(pool: Pool, prefix: &str) -> Self {
        Self {
            pool,
            prefix: prefix.to_string(),
        }
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}:session:{session_id}", self.prefix)
    }

    fn index_key(&self, customer_id: &str) -> String {
        format!("{}:customer_sessions:{customer_id}", self.prefix)
    }

    /// Record write and index update as one MULTI/EXEC transaction.
    ///
    /// The index lives as long as the longest session it points to: `NX`
    /// gives a fresh index an expiry, `GT` only ever extends it (Redis 7+).
    fn write_pipeline(&self, record: &SessionRecord, json: String, secs: u64) -> ::redis::Pipeline {
        let index = self.index_key(&record.customer_id);
        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .set_ex(self.session_key(&record.session_id), json, secs)
            .ignore()
            .sadd(&index, &record.session_id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&index)
            .arg(secs)
            .arg("NX")
            .ignore()
            .cmd("EXPIRE")
            .arg(&index)
            .arg(secs)
            .arg("GT")
            .ignore();
        pipe
    }
}

impl std::fmt::Debug for RedisSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSessionStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(self.session_key(session_id)).await?;
        decode(raw)
    }

    async fn set(&self, record: &SessionRecord, ttl: Duration) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let secs = expiry_secs(ttl);
        let mut conn = self.pool.get().await?;

        self.write_pipeline(record, json, secs)
            .query_async::<()>(&mut conn)
            .await?;

        debug!(customer_id = %record.customer_id, ttl_secs = secs, "Stored session record");
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        // GETDEL makes the liveness answer atomic between concurrent deleters.
        let raw: Option<String> = conn.get_del(self.session_key(session_id)).await?;
        let Some(json) = raw else {
            return Ok(false);
        };
        if let Ok(record) = serde_json::from_str::<SessionRecord>(&json) {
            conn.srem::<_, _, ()>(self.index_key(&record.customer_id), session_id)
                .await?;
        }
        Ok(true)
    }

    async fn list(&self, customer_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let index = self.index_key(customer_id);
        let mut conn = self.pool.get().await?;
        let ids: Vec<String> = conn.smembers(&index).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.session_key(id)).collect();
        let raws: Vec<Option<String>> = ::redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(ids.len());
        let mut dangling = Vec::new();
        for (id, raw) in ids.into_iter().zip(raws) {
            match decode::<SessionRecord>(raw)? {
                Some(record) => records.push(record),
                None => dangling.push(id),
            }
        }
        if !dangling.is_empty() {
            debug!(customer_id, pruned = dangling.len(), "Pruned expired session ids");
            conn.srem::<_, _, ()>(&index, dangling).await?;
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

/// Redis-backed [`FlowStore`].
#[derive(Clone)]
pub struct RedisFlowStore {
    pool: Pool,
    prefix: String,
}

impl RedisFlowStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub fn new(pool: Pool, prefix: &str) -> Self {
        Self {
            pool,
            prefix: prefix.to_string(),
        }
    }

    fn flow_key(&self, state: &str) -> String {
        format!("{}:oidc_flow:{state}", self.prefix)
    }
}

impl std::fmt::Debug for RedisFlowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisFlowStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FlowStore for RedisFlowStore {
    async fn set(&self, record: &OidcFlowRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.pool.get().await?;
        conn.set_ex::<_, _, ()>(self.flow_key(&record.state), json, expiry_secs(FLOW_TTL))
            .await?;
        Ok(())
    }

    async fn get(&self, state: &str) -> Result<Option<OidcFlowRecord>, StoreError> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(self.flow_key(state)).await?;
        decode(raw)
    }

    async fn delete(&self, state: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = conn.del(self.flow_key(state)).await?;
        Ok(deleted > 0)
    }

    async fn take(&self, state: &str) -> Result<Option<OidcFlowRecord>, StoreError> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get_del(self.flow_key(state)).await?;
        decode(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Pool {
        deadpool_redis::Config::from_url("redis://127.0.0.1:6379")
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .expect("Should create pool without connecting")
    }

    #[tokio::test]
    async fn test_key_layout() {
        let sessions = RedisSessionStore::new(pool(), "acme");
        assert_eq!(sessions.session_key("s1"), "acme:session:s1");
        assert_eq!(sessions.index_key("c1"), "acme:customer_sessions:c1");

        let flows = RedisFlowStore::new(pool(), "shop");
        assert_eq!(flows.flow_key("xyz"), "shop:oidc_flow:xyz");
    }

    #[tokio::test]
    async fn test_index_expiry_set_inside_transaction() {
        let sessions = RedisSessionStore::new(pool(), "acme");
        let record = SessionRecord {
            session_id: "s1".to_string(),
            customer_id: "c1".to_string(),
            user_agent: "test".to_string(),
            created_at: chrono::Utc::now(),
        };
        let packed = sessions
            .write_pipeline(&record, "{}".to_string(), 3600)
            .get_packed_pipeline();
        let packed = String::from_utf8(packed).expect("Should be UTF-8");

        let multi = packed.find("MULTI").expect("Should open a transaction");
        let exec = packed.rfind("EXEC").expect("Should close the transaction");
        let nx = packed.find("\r\nNX\r\n").expect("Should set a missing index expiry");
        let gt = packed.find("\r\nGT\r\n").expect("Should extend a shorter index expiry");
        assert!(multi < nx && nx < gt && gt < exec);
        assert_eq!(packed.matches("acme:customer_sessions:c1").count(), 3);
    }

    #[test]
    fn test_expiry_is_at_least_one_second() {
        assert_eq!(expiry_secs(Duration::ZERO), 1);
        assert_eq!(expiry_secs(Duration::from_millis(1500)), 1);
        assert_eq!(expiry_secs(FLOW_TTL), 600);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode::<SessionRecord>(None).unwrap().is_none());
        assert!(matches!(
            decode::<SessionRecord>(Some("not json".to_string())),
            Err(StoreError::Serialization(_))
        ));
    }
}
