//! In-process lock store
//!
//! Honours lease expiry like the real store and lets several simulated
//! replicas share one backend via [`MemoryLockStore::replica`]. Faults can be
//! injected to exercise renewal failure paths.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::coordination::LockStore;
use crate::error::{FleetError, Result};

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Backend {
    leases: Mutex<HashMap<String, Lease>>,
    unavailable: AtomicBool,
    lock_calls: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryLockStore {
    backend: Arc<Backend>,
    owner: String,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(Backend::default()),
            owner: "replica-0".to_string(),
        }
    }

    /// Another client of the same backend, acting as a different replica
    pub fn replica(&self, owner: &str) -> Self {
        Self {
            backend: self.backend.clone(),
            owner: owner.to_string(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Make every subsequent call fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.backend.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current unexpired owner of `name`
    pub fn holder(&self, name: &str) -> Option<String> {
        let leases = self.backend.leases.lock().unwrap_or_else(|p| p.into_inner());
        leases
            .get(name)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.owner.clone())
    }

    /// Drop a lease regardless of owner (simulates expiry or an operator purge)
    pub fn evict(&self, name: &str) {
        let mut leases = self.backend.leases.lock().unwrap_or_else(|p| p.into_inner());
        leases.remove(name);
    }

    pub fn lock_calls(&self) -> u64 {
        self.backend.lock_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.backend.unavailable.load(Ordering::SeqCst) {
            Err(FleetError::LockStore("lock store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn lock(&self, name: &str, ttl: Duration) -> Result<i64> {
        self.backend.lock_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if ttl.is_zero() {
            return Err(FleetError::Validation("lock ttl must be positive".to_string()));
        }

        let now = Instant::now();
        let mut leases = self.backend.leases.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lease) = leases.get(name) {
            if lease.expires_at > now {
                return Ok(0);
            }
        }

        leases.insert(
            name.to_string(),
            Lease {
                owner: self.owner.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(ttl.as_millis() as i64)
    }

    async fn unlock(&self, name: &str) -> Result<()> {
        self.check_available()?;
        let mut leases = self.backend.leases.lock().unwrap_or_else(|p| p.into_inner());
        if leases.get(name).map(|l| l.owner == self.owner).unwrap_or(false) {
            leases.remove(name);
        }
        Ok(())
    }
}
