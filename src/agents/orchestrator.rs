//! Agent Orchestrator
//!
//! Keeps the map of agents this replica owns. The map is a cache of local
//! ownership only; the lock store decides who runs what, and every restore
//! pass re-derives the map from the repository plus the locks.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runtime::AgentRuntime;
use super::traits::{AgentRepository, DecisionLoop, Orchestrator, RestoreSummary};
use crate::config::WorkersConfig;
use crate::coordination::{CircuitBreakerRegistry, LockFactory};
use crate::domain::{AgentId, AgentRecord};
use crate::error::Result;
use crate::exchange::ExchangeFactory;

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tick_interval: Duration,
    pub stop_timeout: Duration,
}

impl From<&WorkersConfig> for OrchestratorConfig {
    fn from(config: &WorkersConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(config.agent_tick_interval_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

enum Admission {
    Started,
    OwnedElsewhere,
    Failed,
}

pub struct AgentOrchestrator {
    repository: Arc<dyn AgentRepository>,
    locks: Arc<dyn LockFactory>,
    decision: Arc<dyn DecisionLoop>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: OrchestratorConfig,
    agents: Mutex<HashMap<AgentId, Arc<AgentRuntime>>>,
    /// Serializes restore passes
    restore_guard: tokio::sync::Mutex<()>,
    /// Parent of every runtime's token and lock renewal
    cancel: CancellationToken,
}

impl AgentOrchestrator {
    pub fn new(
        repository: Arc<dyn AgentRepository>,
        locks: Arc<dyn LockFactory>,
        decision: Arc<dyn DecisionLoop>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: OrchestratorConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            repository,
            locks,
            decision,
            breakers,
            config,
            agents: Mutex::new(HashMap::new()),
            restore_guard: tokio::sync::Mutex::new(()),
            cancel: parent.child_token(),
        }
    }

    fn agents(&self) -> MutexGuard<'_, HashMap<AgentId, Arc<AgentRuntime>>> {
        self.agents.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<Arc<AgentRuntime>> {
        self.agents().get(agent_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.agents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents().is_empty()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn repository(&self) -> &Arc<dyn AgentRepository> {
        &self.repository
    }

    /// Remove runtimes that lost their lock, died, or are no longer desired
    async fn prune(&self, desired: &HashSet<AgentId>) -> usize {
        let candidates: Vec<Arc<AgentRuntime>> = self.agents().values().cloned().collect();

        let mut stale = Vec::new();
        for runtime in candidates {
            let reason = if !desired.contains(runtime.id()) {
                Some("no longer desired")
            } else if !runtime.is_lock_held().await {
                Some("lock lost")
            } else if !runtime.is_running() {
                Some("decision loop exited")
            } else {
                None
            };

            if let Some(reason) = reason {
                info!(agent_id = %runtime.id(), reason, "Dropping local runtime");
                stale.push(runtime);
            }
        }

        {
            let mut agents = self.agents();
            for runtime in &stale {
                agents.remove(runtime.id());
            }
        }

        for runtime in &stale {
            runtime.stop(self.config.stop_timeout).await;
        }
        stale.len()
    }

    async fn admit(
        &self,
        record: AgentRecord,
        exchanges: &Arc<dyn ExchangeFactory>,
    ) -> Admission {
        let agent_id = record.id.clone();
        let lock = self.locks.create_agent_lock(&agent_id);
        let token = self.cancel.child_token();

        match lock.try_acquire(&token).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(agent_id = %agent_id, "Agent owned by another replica");
                return Admission::OwnedElsewhere;
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Lock acquisition failed");
                return Admission::Failed;
            }
        }

        let client = match exchanges.create_client(&record) {
            Ok(client) => client,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Exchange client creation failed, releasing lock");
                token.cancel();
                if let Err(e) = lock.release().await {
                    warn!(agent_id = %agent_id, error = %e, "Lock release failed");
                }
                return Admission::Failed;
            }
        };

        let runtime = Arc::new(AgentRuntime::new(record, lock, client, token));
        runtime.start(
            self.decision.clone(),
            self.breakers.clone(),
            self.config.tick_interval,
        );
        self.agents().insert(agent_id.clone(), runtime);
        info!(agent_id = %agent_id, "Agent restored on this replica");
        Admission::Started
    }
}

#[async_trait]
impl Orchestrator for AgentOrchestrator {
    async fn restore_running_agents(
        &self,
        cancel: &CancellationToken,
        exchanges: Arc<dyn ExchangeFactory>,
    ) -> Result<RestoreSummary> {
        let _pass = self.restore_guard.lock().await;

        let records = self.repository.list_running_agents().await?;
        let desired: HashSet<AgentId> = records.iter().map(|r| r.id.clone()).collect();

        let mut summary = RestoreSummary {
            desired: records.len(),
            ..Default::default()
        };
        summary.dropped = self.prune(&desired).await;

        for record in records {
            if cancel.is_cancelled() || self.cancel.is_cancelled() {
                debug!("Restore pass cancelled");
                break;
            }

            if self.agents().contains_key(&record.id) {
                summary.already_running += 1;
                continue;
            }

            match self.admit(record, &exchanges).await {
                Admission::Started => summary.started += 1,
                Admission::OwnedElsewhere => summary.owned_elsewhere += 1,
                Admission::Failed => summary.failed += 1,
            }
        }

        info!(
            desired = summary.desired,
            started = summary.started,
            already_running = summary.already_running,
            owned_elsewhere = summary.owned_elsewhere,
            dropped = summary.dropped,
            failed = summary.failed,
            "Restore pass complete"
        );
        Ok(summary)
    }

    fn running_agents(&self) -> Vec<Arc<AgentRuntime>> {
        self.agents().values().cloned().collect()
    }

    async fn shutdown(&self) -> Result<()> {
        let _pass = self.restore_guard.lock().await;
        self.cancel.cancel();

        let runtimes: Vec<Arc<AgentRuntime>> = self.agents().drain().map(|(_, rt)| rt).collect();
        info!(count = runtimes.len(), "Stopping agent runtimes");

        let stop_timeout = self.config.stop_timeout;
        futures::future::join_all(runtimes.iter().map(|rt| rt.stop(stop_timeout))).await;
        Ok(())
    }
}
