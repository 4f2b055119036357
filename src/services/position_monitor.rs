//! Position-closure edge detector
//!
//! Polls each owned agent's exchange position and reports the open→closed
//! transition exactly once. A closure books the realized PnL, persists the
//! agent, feeds the agent's and the user's circuit breakers and hands the
//! trade to the reflector on a tracked background task so a slow reflection
//! never delays the next poll.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::agents::{AgentRepository, AgentRuntime, Orchestrator, Reflector};
use crate::config::AppConfig;
use crate::coordination::{CircuitBreakerRegistry, PeriodicWorker, RiskEntity, Worker};
use crate::domain::{AgentRecord, CloseReason, Position, PositionSnapshot, TradeExperience};
use crate::error::{FleetError, Result};
use crate::persistence::{AgentTelemetry, BatchWriter, TelemetryKind};

#[derive(Debug, Clone)]
pub struct PositionMonitorConfig {
    pub interval: Duration,
    /// Bound on each position or order fetch
    pub fetch_timeout: Duration,
    /// Bound on each reflection call
    pub reflection_timeout: Duration,
}

impl From<&AppConfig> for PositionMonitorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.workers.position_monitor_interval_secs),
            fetch_timeout: Duration::from_secs(config.workers.exchange_timeout_secs),
            reflection_timeout: Duration::from_secs(config.reflection.timeout_secs),
        }
    }
}

impl Default for PositionMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(10),
            reflection_timeout: Duration::from_secs(30),
        }
    }
}

/// Monitor counters
#[derive(Debug, Default)]
pub struct PositionMonitorStats {
    pub polls: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub closures: AtomicU64,
    pub reflections_started: AtomicU64,
    pub reflections_failed: AtomicU64,
}

pub struct PositionMonitor {
    orchestrator: Arc<dyn Orchestrator>,
    repository: Arc<dyn AgentRepository>,
    reflector: Arc<dyn Reflector>,
    breakers: Arc<CircuitBreakerRegistry>,
    telemetry: Option<Arc<BatchWriter<AgentTelemetry>>>,
    config: PositionMonitorConfig,
    reflections: TaskTracker,
    stats: Arc<PositionMonitorStats>,
}

impl PositionMonitor {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        repository: Arc<dyn AgentRepository>,
        reflector: Arc<dyn Reflector>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: PositionMonitorConfig,
    ) -> Self {
        Self {
            orchestrator,
            repository,
            reflector,
            breakers,
            telemetry: None,
            config,
            reflections: TaskTracker::new(),
            stats: Arc::new(PositionMonitorStats::default()),
        }
    }

    /// Emit snapshot and closure telemetry through `writer`
    pub fn with_telemetry(mut self, writer: Arc<BatchWriter<AgentTelemetry>>) -> Self {
        self.telemetry = Some(writer);
        self
    }

    pub fn into_periodic(self: Arc<Self>) -> PeriodicWorker {
        let interval = self.config.interval;
        PeriodicWorker::new(self, interval)
    }

    pub fn stats(&self) -> &PositionMonitorStats {
        &self.stats
    }

    /// Reflections spawned but not yet finished
    pub fn reflections_in_flight(&self) -> usize {
        self.reflections.len()
    }

    /// Wait up to `timeout` for in-flight reflections; true when all finished
    pub async fn drain_reflections(&self, timeout: Duration) -> bool {
        self.reflections.close();
        let drained = tokio::time::timeout(timeout, self.reflections.wait())
            .await
            .is_ok();
        self.reflections.reopen();

        if !drained {
            warn!(
                in_flight = self.reflections.len(),
                "Reflections still running after drain timeout"
            );
        }
        drained
    }

    /// Poll one agent and handle a closure edge if one appears
    pub async fn check_agent(&self, runtime: &Arc<AgentRuntime>) -> Result<()> {
        if !runtime.is_lock_held().await {
            debug!(agent_id = %runtime.id(), "Lock not held, skipping position check");
            return Ok(());
        }

        let symbol = runtime.symbol();
        self.stats.polls.fetch_add(1, Ordering::Relaxed);
        let position = match self.fetch_position(runtime, &symbol).await {
            Ok(position) => position,
            Err(e) => {
                self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let open = runtime.observe_position(position.as_ref());

        // The edge is consumed in the same tick it is armed.
        if let Some(closed) = runtime.take_just_closed() {
            self.handle_closure(runtime, closed).await;
        } else if open {
            if let Some(snapshot) = runtime.last_position() {
                self.emit(runtime, TelemetryKind::PositionSnapshot, &snapshot);
            }
        }
        Ok(())
    }

    async fn fetch_position(&self, runtime: &AgentRuntime, symbol: &str) -> Result<Option<Position>> {
        tokio::time::timeout(
            self.config.fetch_timeout,
            runtime.exchange().fetch_position(symbol),
        )
        .await
        .map_err(|_| FleetError::Timeout {
            what: format!("fetch_position {}", symbol),
            elapsed_ms: self.config.fetch_timeout.as_millis() as u64,
        })?
    }

    /// Stop-loss fill wins over take-profit fill; anything else is manual
    async fn classify_close(&self, runtime: &AgentRuntime) -> CloseReason {
        let record = runtime.record();
        let candidates = [
            (record.stop_loss_order_id.as_deref(), CloseReason::StopLoss),
            (record.take_profit_order_id.as_deref(), CloseReason::TakeProfit),
        ];

        for (order_id, reason) in candidates {
            let Some(order_id) = order_id else {
                continue;
            };
            let fetched = tokio::time::timeout(
                self.config.fetch_timeout,
                runtime.exchange().fetch_order(order_id, &record.symbol),
            )
            .await;

            match fetched {
                Ok(Ok(order)) if order.status.is_executed() => return reason,
                Ok(Ok(order)) => {
                    debug!(agent_id = %record.id, order_id, status = ?order.status, "Protective order not executed")
                }
                Ok(Err(e)) => warn!(agent_id = %record.id, order_id, error = %e, "Order fetch failed"),
                Err(_) => warn!(agent_id = %record.id, order_id, "Order fetch timed out"),
            }
        }
        CloseReason::Manual
    }

    async fn handle_closure(&self, runtime: &Arc<AgentRuntime>, closed: PositionSnapshot) {
        let close_reason = self.classify_close(runtime).await;
        let realized_pnl = closed.unrealized_pnl;
        let record = runtime.update_record(|r| {
            r.apply_realized_pnl(realized_pnl);
            r.clone()
        });
        self.stats.closures.fetch_add(1, Ordering::Relaxed);

        info!(
            agent_id = %record.id,
            symbol = %record.symbol,
            reason = %close_reason,
            pnl = %realized_pnl,
            balance = %record.current_balance,
            "Position closed"
        );

        if let Err(e) = self.repository.save_agent_state(&record).await {
            warn!(agent_id = %record.id, error = %e, "Failed to persist agent after closure");
        }

        let breaker = self.breakers.get_or_create(&RiskEntity::Agent(record.id.clone()));
        if let Err(e) = breaker.record_trade(realized_pnl, record.initial_balance).await {
            warn!(agent_id = %record.id, error = %e, "Agent trading halted");
        }

        let user = self.breakers.get_or_create(&RiskEntity::User(record.user_id.clone()));
        let user_balance = self.user_initial_balance(&record);
        if let Err(e) = user.record_trade(realized_pnl, user_balance).await {
            warn!(agent_id = %record.id, user_id = %record.user_id, error = %e, "User trading halted");
        }

        let experience = TradeExperience {
            agent_id: record.id.clone(),
            symbol: record.symbol.clone(),
            side: closed.side,
            size: closed.size,
            entry_price: closed.entry_price,
            realized_pnl,
            close_reason,
            balance_after: record.current_balance,
            closed_at: Utc::now(),
        };
        self.emit(runtime, TelemetryKind::PositionClosed, &experience);
        self.spawn_reflection(experience);
    }

    /// Combined initial balance of the user's agents running on this replica
    fn user_initial_balance(&self, record: &AgentRecord) -> Decimal {
        self.orchestrator
            .running_agents()
            .iter()
            .filter(|rt| rt.id() != &record.id)
            .map(|rt| rt.record())
            .filter(|other| other.user_id == record.user_id)
            .fold(record.initial_balance, |sum, other| {
                sum.saturating_add(other.initial_balance)
            })
    }

    fn spawn_reflection(&self, experience: TradeExperience) {
        let reflector = self.reflector.clone();
        let stats = self.stats.clone();
        let timeout = self.config.reflection_timeout;
        stats.reflections_started.fetch_add(1, Ordering::Relaxed);

        self.reflections.spawn(async move {
            let agent_id = experience.agent_id.clone();
            match tokio::time::timeout(timeout, reflector.reflect(experience)).await {
                Ok(Ok(())) => debug!(agent_id = %agent_id, "Reflection complete"),
                Ok(Err(e)) => {
                    stats.reflections_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(agent_id = %agent_id, error = %e, "Reflection failed");
                }
                Err(_) => {
                    stats.reflections_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(agent_id = %agent_id, timeout_secs = timeout.as_secs(), "Reflection timed out");
                }
            }
        });
    }

    fn emit<P: serde::Serialize>(&self, runtime: &AgentRuntime, kind: TelemetryKind, payload: &P) {
        if let Some(writer) = &self.telemetry {
            let payload = serde_json::to_value(payload).unwrap_or_default();
            let point = AgentTelemetry::new(runtime.id().clone(), kind, payload);
            if let Err(e) = writer.add(point) {
                debug!(agent_id = %runtime.id(), error = %e, "Telemetry dropped");
            }
        }
    }
}

#[async_trait]
impl Worker for PositionMonitor {
    fn name(&self) -> &str {
        "position_monitor"
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let agents = self.orchestrator.running_agents();
        if agents.is_empty() || cancel.is_cancelled() {
            return Ok(());
        }

        let results = futures::future::join_all(agents.iter().map(|rt| self.check_agent(rt))).await;

        for (runtime, result) in agents.iter().zip(results) {
            if let Err(e) = result {
                warn!(agent_id = %runtime.id(), error = %e, "Position check failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{MockAgentRepository, MockReflector, RestoreSummary};
    use crate::coordination::{AlwaysHeldLock, CircuitBreakerConfig};
    use crate::domain::{AgentId, AgentRecord, Order, OrderStatus, PositionSide};
    use crate::exchange::{ExchangeFactory, MockExchangeClient};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct FixedOrchestrator(Vec<Arc<AgentRuntime>>);

    #[async_trait]
    impl Orchestrator for FixedOrchestrator {
        async fn restore_running_agents(
            &self,
            _cancel: &CancellationToken,
            _exchanges: Arc<dyn ExchangeFactory>,
        ) -> Result<RestoreSummary> {
            Ok(RestoreSummary::default())
        }

        fn running_agents(&self) -> Vec<Arc<AgentRuntime>> {
            self.0.clone()
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    fn long(pnl: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            size: dec!(0.5),
            entry_price: dec!(60000),
            unrealized_pnl: pnl,
        }
    }

    fn monitor_for(
        client: MockExchangeClient,
        record: AgentRecord,
        repo: MockAgentRepository,
        reflector: MockReflector,
    ) -> (PositionMonitor, Arc<AgentRuntime>, Arc<CircuitBreakerRegistry>) {
        let runtime = Arc::new(AgentRuntime::new(
            record.clone(),
            Arc::new(AlwaysHeldLock::new(record.id.clone())),
            Arc::new(client),
            CancellationToken::new(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), None));
        let monitor = PositionMonitor::new(
            Arc::new(FixedOrchestrator(vec![runtime.clone()])),
            Arc::new(repo),
            Arc::new(reflector),
            breakers.clone(),
            PositionMonitorConfig::default(),
        );
        (monitor, runtime, breakers)
    }

    #[tokio::test]
    async fn test_stop_loss_fill_classifies_closure() {
        let mut client = MockExchangeClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_fetch_position()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(long(dec!(-40)))));
        client
            .expect_fetch_position()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        client
            .expect_fetch_order()
            .withf(|id, _| id == "sl-1")
            .times(1)
            .returning(|id, symbol| {
                Ok(Order {
                    order_id: id.to_string(),
                    symbol: symbol.to_string(),
                    status: OrderStatus::Filled,
                })
            });

        let mut record = AgentRecord::new("a1", "u1", "BTCUSDT", dec!(1000));
        record.stop_loss_order_id = Some("sl-1".into());
        record.take_profit_order_id = Some("tp-1".into());

        let mut repo = MockAgentRepository::new();
        repo.expect_save_agent_state()
            .withf(|r| r.current_balance == dec!(960) && r.stop_loss_order_id.is_none())
            .times(1)
            .returning(|_| Ok(()));

        let mut reflector = MockReflector::new();
        reflector
            .expect_reflect()
            .withf(|exp| exp.close_reason == CloseReason::StopLoss && exp.realized_pnl == dec!(-40))
            .times(1)
            .returning(|_| Ok(()));

        let (monitor, runtime, breakers) = monitor_for(client, record, repo, reflector);
        let cancel = CancellationToken::new();

        monitor.run(&cancel).await.unwrap();
        monitor.run(&cancel).await.unwrap();
        assert!(monitor.drain_reflections(Duration::from_secs(1)).await);

        assert_eq!(monitor.stats().closures.load(Ordering::Relaxed), 1);
        assert_eq!(runtime.record().realized_pnl, dec!(-40));
        let status = breakers
            .get(&RiskEntity::Agent(AgentId::from("a1")))
            .expect("agent breaker")
            .status();
        assert_eq!(status.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn test_no_protective_orders_means_manual() {
        let mut client = MockExchangeClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_fetch_position()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(long(dec!(15)))));
        client
            .expect_fetch_position()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        client.expect_fetch_order().never();

        let mut repo = MockAgentRepository::new();
        repo.expect_save_agent_state().returning(|_| Ok(()));
        let mut reflector = MockReflector::new();
        reflector
            .expect_reflect()
            .withf(|exp| exp.close_reason == CloseReason::Manual)
            .times(1)
            .returning(|_| Ok(()));

        let record = AgentRecord::new("a1", "u1", "BTCUSDT", dec!(1000));
        let (monitor, _runtime, _) = monitor_for(client, record, repo, reflector);
        let cancel = CancellationToken::new();

        monitor.run(&cancel).await.unwrap();
        monitor.run(&cancel).await.unwrap();
        assert!(monitor.drain_reflections(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_snapshot_untouched() {
        let mut client = MockExchangeClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_fetch_position()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(long(dec!(5)))));
        client
            .expect_fetch_position()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(FleetError::Exchange("503".into())));

        let record = AgentRecord::new("a1", "u1", "BTCUSDT", dec!(1000));
        let (monitor, runtime, _) =
            monitor_for(client, record, MockAgentRepository::new(), MockReflector::new());

        monitor.check_agent(&runtime).await.unwrap();
        assert!(monitor.check_agent(&runtime).await.is_err());
        assert!(runtime.last_position().is_some());
        assert_eq!(monitor.stats().closures.load(Ordering::Relaxed), 0);
    }
}
