//! Redis-backed lock store
//!
//! Each store instance carries a random owner token, so an unlock only
//! deletes a lease this replica actually holds. Point `redis_url` at a
//! deployment with the consistency guarantees you need (e.g. a quorum-backed
//! Redis-compatible service); this client does not implement multi-node
//! agreement itself.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::coordination::LockStore;
use crate::error::{FleetError, Result};

/// SET NX PX, answering with the remaining lease or 0 when taken
const LOCK_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
    return redis.call('PTTL', KEYS[1])
end
return 0
"#;

/// Compare-and-delete so we never remove someone else's lease
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisLockStore {
    conn: MultiplexedConnection,
    owner: String,
    lock_script: Script,
    unlock_script: Script,
}

impl RedisLockStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let owner = Uuid::new_v4().to_string();

        info!(owner = %owner, "Connected to lock store");
        Ok(Self {
            conn,
            owner,
            lock_script: Script::new(LOCK_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        })
    }

    /// Token identifying this replica's leases
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn lock(&self, name: &str, ttl: Duration) -> Result<i64> {
        let ttl_ms = ttl.as_millis() as i64;
        if ttl_ms <= 0 {
            return Err(FleetError::Validation(format!(
                "lock ttl must be positive, got {:?}",
                ttl
            )));
        }

        let mut conn = self.conn.clone();
        let lease_ms: i64 = self
            .lock_script
            .key(name)
            .arg(&self.owner)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        debug!(lock = name, lease_ms, "Lock store answered");
        Ok(lease_ms)
    }

    async fn unlock(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .unlock_script
            .key(name)
            .arg(&self.owner)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            debug!(lock = name, "Unlock found no lease owned by this replica");
        }
        Ok(())
    }
}
