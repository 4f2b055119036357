use std::sync::Arc;
use std::time::Duration;

use super::agent_lock::{AgentLock, AlwaysHeldLock, StoreAgentLock};
use super::lock_store::LockStore;
use crate::config::LockConfig;
use crate::domain::AgentId;

/// Creates the ownership lock for an agent identity
pub trait LockFactory: Send + Sync {
    fn create_agent_lock(&self, agent_id: &AgentId) -> Arc<dyn AgentLock>;
}

/// Factory bound to a real lock store
pub struct StoreLockFactory {
    store: Arc<dyn LockStore>,
    key_prefix: String,
    ttl: Duration,
    op_timeout: Duration,
}

impl StoreLockFactory {
    pub fn new(store: Arc<dyn LockStore>, config: &LockConfig) -> Self {
        Self {
            store,
            key_prefix: config.key_prefix.clone(),
            ttl: config.ttl(),
            op_timeout: config.op_timeout(),
        }
    }

    /// Override the lease duration (tests use sub-second leases)
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn lock_name(&self, agent_id: &AgentId) -> String {
        format!("{}{}", self.key_prefix, agent_id)
    }
}

impl LockFactory for StoreLockFactory {
    fn create_agent_lock(&self, agent_id: &AgentId) -> Arc<dyn AgentLock> {
        Arc::new(StoreAgentLock::new(
            agent_id.clone(),
            self.lock_name(agent_id),
            self.ttl,
            self.op_timeout,
            self.store.clone(),
        ))
    }
}

/// Factory whose locks always succeed and are always held
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockFactory;

impl LockFactory for NoopLockFactory {
    fn create_agent_lock(&self, agent_id: &AgentId) -> Arc<dyn AgentLock> {
        Arc::new(AlwaysHeldLock::new(agent_id.clone()))
    }
}
