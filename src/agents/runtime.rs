//! Per-agent runtime owned by one replica
//!
//! Holds the agent record, its ownership lock, its exchange client and the
//! last observed position. The decision loop runs on its own task and is
//! gated on the lock being held locally and on the circuit breakers.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::DecisionLoop;
use crate::coordination::worker::clamp_interval;
use crate::coordination::{AgentLock, CircuitBreakerRegistry};
use crate::domain::{AgentId, AgentRecord, Position, PositionSnapshot};
use crate::exchange::ExchangeClient;

/// Last-known position plus the open→closed edge flag
#[derive(Debug, Default, Clone)]
pub struct PositionTracker {
    last: Option<PositionSnapshot>,
    just_closed: Option<PositionSnapshot>,
}

impl PositionTracker {
    /// Fold in a fresh exchange observation; returns whether a position is open.
    ///
    /// A transition from open to flat arms the edge flag with the last open
    /// snapshot. Further flat observations leave it untouched.
    pub fn observe(&mut self, current: Option<&Position>) -> bool {
        match current.filter(|p| p.is_open()) {
            Some(position) => {
                self.last = Some(PositionSnapshot::from(position));
                true
            }
            None => {
                if let Some(prev) = self.last.take() {
                    self.just_closed = Some(prev);
                }
                false
            }
        }
    }

    pub fn last(&self) -> Option<&PositionSnapshot> {
        self.last.as_ref()
    }

    /// Consume the edge flag
    pub fn take_just_closed(&mut self) -> Option<PositionSnapshot> {
        self.just_closed.take()
    }
}

pub struct AgentRuntime {
    id: AgentId,
    record: Mutex<AgentRecord>,
    lock: Arc<dyn AgentLock>,
    exchange: Arc<dyn ExchangeClient>,
    position: Mutex<PositionTracker>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
    ticks: AtomicU64,
    blocked_ticks: AtomicU64,
}

impl AgentRuntime {
    pub fn new(
        record: AgentRecord,
        lock: Arc<dyn AgentLock>,
        exchange: Arc<dyn ExchangeClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: record.id.clone(),
            record: Mutex::new(record),
            lock,
            exchange,
            position: Mutex::new(PositionTracker::default()),
            cancel,
            task: Mutex::new(None),
            started_at: Utc::now(),
            ticks: AtomicU64::new(0),
            blocked_ticks: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    fn record_guard(&self) -> MutexGuard<'_, AgentRecord> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn position_guard(&self) -> MutexGuard<'_, PositionTracker> {
        self.position.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the current record
    pub fn record(&self) -> AgentRecord {
        self.record_guard().clone()
    }

    pub fn user_id(&self) -> String {
        self.record_guard().user_id.clone()
    }

    pub fn symbol(&self) -> String {
        self.record_guard().symbol.clone()
    }

    /// Mutate the record in place and return whatever the closure returns
    pub fn update_record<R>(&self, f: impl FnOnce(&mut AgentRecord) -> R) -> R {
        f(&mut self.record_guard())
    }

    pub fn lock(&self) -> &Arc<dyn AgentLock> {
        &self.lock
    }

    pub fn exchange(&self) -> &Arc<dyn ExchangeClient> {
        &self.exchange
    }

    /// Local ownership flag; a failing check counts as not held
    pub async fn is_lock_held(&self) -> bool {
        match self.lock.check_lock_held().await {
            Ok(held) => held,
            Err(e) => {
                warn!(agent_id = %self.id, error = %e, "Lock check failed");
                false
            }
        }
    }

    pub fn observe_position(&self, current: Option<&Position>) -> bool {
        self.position_guard().observe(current)
    }

    pub fn last_position(&self) -> Option<PositionSnapshot> {
        self.position_guard().last().cloned()
    }

    pub fn take_just_closed(&self) -> Option<PositionSnapshot> {
        self.position_guard().take_just_closed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn blocked_ticks(&self) -> u64 {
        self.blocked_ticks.load(Ordering::Relaxed)
    }

    /// Whether the decision loop is still alive
    pub fn is_running(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        task.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Spawn the decision loop. Calling twice is a no-op.
    pub fn start(
        self: &Arc<Self>,
        decision: Arc<dyn DecisionLoop>,
        breakers: Arc<CircuitBreakerRegistry>,
        interval: Duration,
    ) {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() {
            return;
        }
        let interval = clamp_interval(interval);

        info!(agent_id = %self.id, interval_secs = interval.as_secs(), "Starting agent runtime");
        *task = Some(tokio::spawn(decision_loop(
            Arc::downgrade(self),
            decision,
            breakers,
            interval,
            self.cancel.clone(),
        )));
    }

    /// Stop the decision loop and release the lock.
    ///
    /// A step that does not finish within `timeout` is abandoned, not aborted.
    pub async fn stop(&self, timeout: Duration) {
        self.cancel.cancel();

        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(agent_id = %self.id, error = %e, "Decision loop ended abnormally"),
                Err(_) => warn!(
                    agent_id = %self.id,
                    timeout_secs = timeout.as_secs(),
                    "Decision step still running, abandoning it"
                ),
            }
        }

        if let Err(e) = self.lock.release().await {
            warn!(agent_id = %self.id, error = %e, "Lock release failed, lease will expire");
        }
        info!(agent_id = %self.id, "Agent runtime stopped");
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn decision_loop(
    runtime: Weak<AgentRuntime>,
    decision: Arc<dyn DecisionLoop>,
    breakers: Arc<CircuitBreakerRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(rt) = runtime.upgrade() else {
            break;
        };

        if !rt.is_lock_held().await {
            warn!(agent_id = %rt.id, "Lock no longer held, stopping decision loop");
            break;
        }

        let user_id = rt.user_id();
        if breakers.is_blocked(&rt.id, &user_id) {
            rt.blocked_ticks.fetch_add(1, Ordering::Relaxed);
            debug!(agent_id = %rt.id, user_id = %user_id, "Circuit breaker open, skipping decision");
            continue;
        }

        if let Err(e) = decision.tick(&rt, &cancel).await {
            warn!(agent_id = %rt.id, error = %e, "Decision step failed");
        }
        rt.ticks.fetch_add(1, Ordering::Relaxed);
    }

    debug!("Decision loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{AlwaysHeldLock, CircuitBreakerConfig};
    use crate::domain::PositionSide;
    use crate::error::Result;
    use crate::exchange::MockExchangeClient;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct CountingLoop;

    #[async_trait]
    impl DecisionLoop for CountingLoop {
        async fn tick(&self, _runtime: &AgentRuntime, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    fn open(size: rust_decimal::Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            size,
            entry_price: dec!(50000),
            unrealized_pnl: dec!(12.5),
        }
    }

    fn runtime() -> Arc<AgentRuntime> {
        let record = AgentRecord::new("a1", "u1", "BTCUSDT", dec!(1000));
        Arc::new(AgentRuntime::new(
            record,
            Arc::new(AlwaysHeldLock::new(AgentId::from("a1"))),
            Arc::new(MockExchangeClient::new()),
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_tracker_arms_edge_once() {
        let mut tracker = PositionTracker::default();

        assert!(tracker.observe(Some(&open(dec!(0.1)))));
        assert!(!tracker.observe(None));
        assert!(!tracker.observe(None));

        let closed = tracker.take_just_closed().expect("closure edge");
        assert_eq!(closed.unrealized_pnl, dec!(12.5));
        assert!(tracker.take_just_closed().is_none());
    }

    #[test]
    fn test_zero_size_counts_as_flat() {
        let mut tracker = PositionTracker::default();
        tracker.observe(Some(&open(dec!(1))));
        assert!(!tracker.observe(Some(&open(dec!(0)))));
        assert!(tracker.take_just_closed().is_some());
    }

    #[test]
    fn test_flat_start_never_arms_edge() {
        let mut tracker = PositionTracker::default();
        tracker.observe(None);
        assert!(tracker.take_just_closed().is_none());
    }

    #[tokio::test]
    async fn test_decision_loop_runs_and_stops() {
        let rt = runtime();
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), None));
        rt.start(Arc::new(CountingLoop), breakers, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rt.is_running());
        assert!(rt.ticks() >= 1);

        rt.stop(Duration::from_secs(1)).await;
        assert!(!rt.is_running());
        let ticks = rt.ticks();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rt.ticks(), ticks);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_decisions() {
        let rt = runtime();
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), None));
        breakers
            .get_or_create(&crate::coordination::RiskEntity::User("u1".into()))
            .trip("operator halt")
            .await;

        rt.start(Arc::new(CountingLoop), breakers, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(rt.ticks(), 0);
        assert!(rt.blocked_ticks() >= 1);
        rt.stop(Duration::from_secs(1)).await;
    }
    #[tokio::test]
    async fn test_zero_tick_interval_keeps_loop_alive() {
        let rt = runtime();
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), None));
        rt.start(Arc::new(CountingLoop), breakers, Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rt.is_running());
        assert!(rt.ticks() >= 2);
        rt.stop(Duration::from_secs(1)).await;
    }
}
