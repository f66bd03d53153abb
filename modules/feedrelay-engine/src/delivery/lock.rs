//! Mutual exclusion for outbound delivery calls.
//!
//! Multiple shard processes share the destination platform's REST
//! endpoint and its rate-limit bucket, so a send must be owned by one
//! process at a time. With a coordination backend configured the lock
//! lives in redis; without one, a named in-process mutex keeps the
//! calling code on a single path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Fixed namespace for all delivery lock keys.
pub const LOCK_NAMESPACE: &str = "feedrelay:delivery";

/// Lock TTL. A crashed holder frees the key after this long.
const LOCK_TTL_MS: u64 = 30_000;
/// Spin delay between acquisition attempts on a held key.
const RETRY_DELAY_MS: u64 = 50;

pub fn lock_key(kind: &str, id: &str) -> String {
    format!("{LOCK_NAMESPACE}:{kind}:{id}")
}

/// Proof of lock ownership, handed back on release. Carries the
/// fencing token for the distributed case and the mutex guard for the
/// in-process case.
pub struct LockLease {
    key: String,
    token: String,
    _guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
pub trait DeliveryMutex: Send + Sync {
    /// Block until the key is owned by this caller. Coordination
    /// backend failures are fatal and propagate; once coordination is
    /// configured there is no silent uncoordinated fallback.
    async fn acquire(&self, key: &str) -> Result<LockLease>;
    async fn release(&self, lease: LockLease) -> Result<()>;
}

// --- In-process implementation ---

/// Named in-process locks for deployments without a coordination
/// backend (single shard).
#[derive(Default)]
pub struct LocalMutex {
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LocalMutex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryMutex for LocalMutex {
    async fn acquire(&self, key: &str) -> Result<LockLease> {
        let mutex = {
            let mut locks = self.locks.lock().expect("lock map poisoned");
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        Ok(LockLease {
            key: key.to_string(),
            token: String::new(),
            _guard: Some(guard),
        })
    }

    async fn release(&self, lease: LockLease) -> Result<()> {
        drop(lease);
        Ok(())
    }
}

// --- Distributed implementation ---

/// Redis-backed lock: `SET key token NX PX ttl` to acquire, a fenced
/// compare-and-delete script to release so an expired holder cannot
/// free a successor's lock.
pub struct RedisMutex {
    conn: ConnectionManager,
}

impl RedisMutex {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).context("Invalid coordination backend URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to coordination backend")?;
        Ok(Self { conn })
    }
}

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end"#;

#[async_trait]
impl DeliveryMutex for RedisMutex {
    async fn acquire(&self, key: &str) -> Result<LockLease> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(LOCK_TTL_MS)
                .query_async(&mut conn)
                .await
                .context("Coordination backend SET failed")?;
            if acquired.is_some() {
                return Ok(LockLease {
                    key: key.to_string(),
                    token,
                    _guard: None,
                });
            }
            tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
        }
    }

    async fn release(&self, lease: LockLease) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .context("Coordination backend release failed")?;
        Ok(())
    }
}
