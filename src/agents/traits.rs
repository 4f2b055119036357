//! Contracts between the runtime and its collaborators
//!
//! The decision logic, trade reflection and record storage live outside this
//! crate; the orchestrator and workers only see these traits.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::runtime::AgentRuntime;
use crate::domain::{AgentRecord, TradeExperience};
use crate::error::Result;
use crate::exchange::ExchangeFactory;

/// Agent record storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Agents whose desired status is running, across the whole fleet
    async fn list_running_agents(&self) -> Result<Vec<AgentRecord>>;

    async fn save_agent_state(&self, agent: &AgentRecord) -> Result<()>;
}

/// Post-trade learning step
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(&self, experience: TradeExperience) -> Result<()>;
}

/// One step of an agent's decision logic.
///
/// Only ever invoked while the agent's lock is held locally and no circuit
/// breaker blocks the agent or its user. Implementations must still re-check
/// `runtime.is_lock_held()` before any side-effecting call, since ownership
/// can be lost mid-step.
#[async_trait]
pub trait DecisionLoop: Send + Sync {
    async fn tick(&self, runtime: &AgentRuntime, cancel: &CancellationToken) -> Result<()>;
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Agents that should be running according to the repository
    pub desired: usize,
    /// Newly acquired and started on this replica
    pub started: usize,
    /// Already running here with the lock held
    pub already_running: usize,
    /// Lock owned by another replica
    pub owned_elsewhere: usize,
    /// Local runtimes dropped because their lock was lost or they stopped
    pub dropped: usize,
    /// Lock store or exchange errors; retried on the next pass
    pub failed: usize,
}

/// Owner of the map of agents running on this replica
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Reconcile local runtimes with the repository and the lock store.
    ///
    /// Idempotent: agents already owned here are left alone, agents owned
    /// elsewhere are skipped, runtimes that lost their lock are dropped.
    async fn restore_running_agents(
        &self,
        cancel: &CancellationToken,
        exchanges: Arc<dyn ExchangeFactory>,
    ) -> Result<RestoreSummary>;

    /// Runtimes currently owned by this replica
    fn running_agents(&self) -> Vec<Arc<AgentRuntime>>;

    /// Stop every runtime and release its lock
    async fn shutdown(&self) -> Result<()>;
}
