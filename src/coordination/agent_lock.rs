//! Distributed Agent Lock
//!
//! One lock per agent identity. Ownership truth lives in the lock store; each
//! replica only keeps a local `held` flag that is set on acquire, kept alive
//! by a renewal task and cleared on release or on the first failed renewal.
//!
//! Renewal is unlock followed by lock because the store has no extend call.
//! Between the two calls another replica can win the name, so callers must
//! re-check [`AgentLock::check_lock_held`] before every side-effecting action,
//! not only after acquiring. A store with a native lease-extend call can
//! replace [`LockShared::renew`] and close that window.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::lock_store::LockStore;
use crate::domain::AgentId;
use crate::error::{FleetError, Result};

/// Per-agent execution ownership
#[async_trait]
pub trait AgentLock: Send + Sync {
    /// Identity this lock guards
    fn agent_id(&self) -> &AgentId;

    /// Try to become the owner.
    ///
    /// `Ok(false)` means another replica owns the agent; that is a normal
    /// outcome, not an error. Calling this on a lock that is already held is a
    /// no-op success. On success a renewal task bound to `cancel` is started.
    async fn try_acquire(&self, cancel: &CancellationToken) -> Result<bool>;

    /// Stop renewing and give the lock back.
    ///
    /// The local flag is always cleared; a failing remote unlock is logged and
    /// left for the lease to expire.
    async fn release(&self) -> Result<()>;

    /// Local ownership flag, without a store round trip
    async fn check_lock_held(&self) -> Result<bool>;
}

/// State shared between the lock handle and its renewal task
struct LockShared {
    agent_id: AgentId,
    lock_name: String,
    ttl: Duration,
    op_timeout: Duration,
    store: Arc<dyn LockStore>,
    held: AtomicBool,
    /// A lease granted to us may still exist in the store. Survives a
    /// cancelled renewal so release can still give the name back early.
    lease_outstanding: AtomicBool,
    /// Bumped on every acquire and release so a stale renewal task cannot
    /// clear the flag of a newer acquisition.
    generation: AtomicU64,
    /// Serializes acquire, renewal and release against the store
    ops: tokio::sync::Mutex<()>,
}

impl LockShared {
    async fn lock_once(&self) -> Result<i64> {
        match tokio::time::timeout(self.op_timeout, self.store.lock(&self.lock_name, self.ttl)).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::LockTimeout {
                op: "lock",
                lock: self.lock_name.clone(),
            }),
        }
    }

    async fn unlock_once(&self) -> Result<()> {
        match tokio::time::timeout(self.op_timeout, self.store.unlock(&self.lock_name)).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::LockTimeout {
                op: "unlock",
                lock: self.lock_name.clone(),
            }),
        }
    }

    /// Release-then-reacquire. Returns the new lease in milliseconds.
    async fn renew(&self) -> Result<i64> {
        if let Err(e) = self.unlock_once().await {
            // The reacquire below fails too if our lease is still in place.
            debug!(lock = %self.lock_name, error = %e, "Unlock during renewal failed");
        }
        self.lock_once().await
    }
}

/// Agent lock backed by a [`LockStore`]
pub struct StoreAgentLock {
    shared: Arc<LockShared>,
    renewal: Mutex<Option<CancellationToken>>,
}

impl StoreAgentLock {
    /// Create a lock for `agent_id` stored under `lock_name`
    pub fn new(
        agent_id: AgentId,
        lock_name: String,
        ttl: Duration,
        op_timeout: Duration,
        store: Arc<dyn LockStore>,
    ) -> Self {
        Self {
            shared: Arc::new(LockShared {
                agent_id,
                lock_name,
                ttl,
                op_timeout,
                store,
                held: AtomicBool::new(false),
                lease_outstanding: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                ops: tokio::sync::Mutex::new(()),
            }),
            renewal: Mutex::new(None),
        }
    }

    pub fn lock_name(&self) -> &str {
        &self.shared.lock_name
    }

    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    /// Interval between renewals: two thirds of the lease
    pub fn renewal_interval(&self) -> Duration {
        self.shared.ttl - self.shared.ttl / 3
    }

    fn take_renewal(&self) -> Option<CancellationToken> {
        match self.renewal.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn start_renewal(&self, cancel: &CancellationToken, generation: u64) {
        let token = cancel.child_token();
        if let Some(previous) = self.take_renewal() {
            previous.cancel();
        }
        match self.renewal.lock() {
            Ok(mut slot) => *slot = Some(token.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(token.clone()),
        }

        let shared = self.shared.clone();
        let interval = self.renewal_interval();
        tokio::spawn(renewal_loop(shared, token, interval, generation));
    }
}

async fn renewal_loop(
    shared: Arc<LockShared>,
    token: CancellationToken,
    interval: Duration,
    generation: u64,
) {
    let mut lost = false;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let _guard = shared.ops.lock().await;
        if token.is_cancelled() {
            // A release got in between the timer and the store call.
            break;
        }

        match shared.renew().await {
            Ok(lease_ms) if lease_ms > 0 => {
                debug!(
                    agent_id = %shared.agent_id,
                    lock = %shared.lock_name,
                    lease_ms,
                    "Lock renewed"
                );
            }
            Ok(lease_ms) => {
                warn!(
                    agent_id = %shared.agent_id,
                    lock = %shared.lock_name,
                    lease_ms,
                    "Lock lost during renewal"
                );
                lost = true;
                break;
            }
            Err(e) => {
                warn!(
                    agent_id = %shared.agent_id,
                    lock = %shared.lock_name,
                    error = %e,
                    "Lock renewal failed, treating as lost"
                );
                lost = true;
                break;
            }
        }
    }

    // Nobody renews this lease any more; it will lapse in the store.
    let _guard = shared.ops.lock().await;
    if shared.generation.load(Ordering::SeqCst) == generation {
        shared.held.store(false, Ordering::SeqCst);
        if lost {
            shared.lease_outstanding.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl AgentLock for StoreAgentLock {
    fn agent_id(&self) -> &AgentId {
        &self.shared.agent_id
    }

    async fn try_acquire(&self, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }

        let _guard = self.shared.ops.lock().await;
        if self.shared.held.load(Ordering::SeqCst) {
            return Ok(true);
        }

        let lease_ms = self.shared.lock_once().await?;
        if lease_ms < 0 {
            return Err(FleetError::MalformedLease {
                lock: self.shared.lock_name.clone(),
                lease_ms,
            });
        }
        if lease_ms == 0 {
            debug!(
                agent_id = %self.shared.agent_id,
                lock = %self.shared.lock_name,
                "Lock held by another replica"
            );
            return Ok(false);
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.held.store(true, Ordering::SeqCst);
        self.shared.lease_outstanding.store(true, Ordering::SeqCst);
        self.start_renewal(cancel, generation);

        info!(
            agent_id = %self.shared.agent_id,
            lock = %self.shared.lock_name,
            lease_ms,
            "Lock acquired"
        );
        Ok(true)
    }

    async fn release(&self) -> Result<()> {
        if let Some(token) = self.take_renewal() {
            token.cancel();
        }

        let _guard = self.shared.ops.lock().await;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.held.store(false, Ordering::SeqCst);
        if !self.shared.lease_outstanding.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        match self.shared.unlock_once().await {
            Ok(()) => info!(
                agent_id = %self.shared.agent_id,
                lock = %self.shared.lock_name,
                "Lock released"
            ),
            Err(e) => warn!(
                agent_id = %self.shared.agent_id,
                lock = %self.shared.lock_name,
                error = %e,
                "Remote unlock failed, lease will expire"
            ),
        }
        Ok(())
    }

    async fn check_lock_held(&self) -> Result<bool> {
        Ok(self.shared.held.load(Ordering::SeqCst))
    }
}

impl Drop for StoreAgentLock {
    fn drop(&mut self) {
        if let Some(token) = self.take_renewal() {
            token.cancel();
        }
    }
}

/// Lock that is always granted and always held
pub struct AlwaysHeldLock {
    agent_id: AgentId,
}

impl AlwaysHeldLock {
    pub fn new(agent_id: AgentId) -> Self {
        Self { agent_id }
    }
}

#[async_trait]
impl AgentLock for AlwaysHeldLock {
    fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    async fn try_acquire(&self, _cancel: &CancellationToken) -> Result<bool> {
        Ok(true)
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }

    async fn check_lock_held(&self) -> Result<bool> {
        Ok(true)
    }
}
