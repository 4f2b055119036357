//! Recovery (reconciliation) worker
//!
//! Repeatedly asks the orchestrator to restore running agents. It keeps no
//! state of its own beyond the last summary; idempotence and lock safety
//! live in the orchestrator and the locks.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agents::{Orchestrator, RestoreSummary};
use crate::config::WorkersConfig;
use crate::coordination::{PeriodicWorker, Worker};
use crate::error::Result;
use crate::exchange::ExchangeFactory;

pub struct RecoveryWorker {
    orchestrator: Arc<dyn Orchestrator>,
    exchanges: Arc<dyn ExchangeFactory>,
    last_summary: Mutex<Option<RestoreSummary>>,
    passes: AtomicU64,
}

impl RecoveryWorker {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, exchanges: Arc<dyn ExchangeFactory>) -> Self {
        Self {
            orchestrator,
            exchanges,
            last_summary: Mutex::new(None),
            passes: AtomicU64::new(0),
        }
    }

    /// Schedule with the configured interval and one-time startup delay
    pub fn into_periodic(self: Arc<Self>, config: &WorkersConfig) -> PeriodicWorker {
        PeriodicWorker::new(self, Duration::from_secs(config.recovery_interval_secs))
            .with_initial_delay(Duration::from_secs(config.recovery_startup_delay_secs))
    }

    pub fn last_summary(&self) -> Option<RestoreSummary> {
        self.last_summary
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Worker for RecoveryWorker {
    fn name(&self) -> &str {
        "agent_recovery"
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let summary = self
            .orchestrator
            .restore_running_agents(cancel, self.exchanges.clone())
            .await?;

        self.passes.fetch_add(1, Ordering::Relaxed);
        debug!(started = summary.started, dropped = summary.dropped, "Recovery pass recorded");
        *self.last_summary.lock().unwrap_or_else(|p| p.into_inner()) = Some(summary);
        Ok(())
    }
}
