//! Trading Circuit Breaker
//!
//! Per-entity (user or agent) risk gate. Trips on a run of losing trades or on
//! realized daily loss measured against the entity's initial balance, then
//! blocks new positions until the cooldown elapses or an operator closes it.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::RiskConfig;
use crate::domain::AgentId;
use crate::error::{FleetError, Result};

/// Audit sink for breaker trips
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RiskEventSink: Send + Sync {
    async fn log_risk_event(
        &self,
        entity_id: &str,
        event_type: &str,
        description: &str,
        data: serde_json::Value,
    ) -> Result<()>;
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// Normal operation - new trades allowed
    Closed,
    /// Threshold exceeded - new trades blocked
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

/// Entity a breaker protects
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RiskEntity {
    User(String),
    Agent(AgentId),
}

impl std::fmt::Display for RiskEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskEntity::User(id) => write!(f, "user:{}", id),
            RiskEntity::Agent(id) => write!(f, "agent:{}", id),
        }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub max_consecutive_losses: u32,
    /// Realized daily loss in percent of initial balance
    pub max_daily_loss_pct: Decimal,
    pub cooldown: Duration,
    /// Upper bound for persisting a trip event
    pub event_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&RiskConfig::default())
    }
}

impl From<&RiskConfig> for CircuitBreakerConfig {
    fn from(risk: &RiskConfig) -> Self {
        Self {
            max_consecutive_losses: risk.max_consecutive_losses,
            max_daily_loss_pct: risk.max_daily_loss_pct,
            cooldown: Duration::from_secs(risk.cooldown_secs),
            event_timeout: Duration::from_secs(5),
        }
    }
}

/// Trip reasons for the circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripReason {
    ConsecutiveLosses { count: u32, max: u32 },
    DailyLossLimit { loss_pct: Decimal, max_pct: Decimal },
    Manual { reason: String },
}

impl TripReason {
    pub fn event_type(&self) -> &'static str {
        match self {
            TripReason::ConsecutiveLosses { .. } => "circuit_breaker_consecutive_losses",
            TripReason::DailyLossLimit { .. } => "circuit_breaker_daily_loss",
            TripReason::Manual { .. } => "circuit_breaker_manual",
        }
    }
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::ConsecutiveLosses { count, max } => {
                write!(f, "{} consecutive losses (max {})", count, max)
            }
            TripReason::DailyLossLimit { loss_pct, max_pct } => {
                write!(f, "daily loss {}% (max {}%)", loss_pct.round_dp(2), max_pct)
            }
            TripReason::Manual { reason } => write!(f, "manual: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerState {
    is_open: bool,
    consecutive_losses: u32,
    daily_loss: Decimal,
    opened_at: Option<DateTime<Utc>>,
    last_reset_date: NaiveDate,
    last_trip_reason: Option<TripReason>,
    total_trips: u64,
}

impl BreakerState {
    fn new(today: NaiveDate) -> Self {
        Self {
            is_open: false,
            consecutive_losses: 0,
            daily_loss: Decimal::ZERO,
            opened_at: None,
            last_reset_date: today,
            last_trip_reason: None,
            total_trips: 0,
        }
    }
}

/// Observable breaker status
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub entity: String,
    pub state: CircuitState,
    pub is_open: bool,
    pub consecutive_losses: u32,
    pub daily_loss: Decimal,
    pub opened_at: Option<DateTime<Utc>>,
    pub remaining_cooldown_secs: u64,
    pub last_trip_reason: Option<TripReason>,
    pub total_trips: u64,
}

/// Circuit breaker for one entity
pub struct CircuitBreaker {
    entity: RiskEntity,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: Option<Arc<dyn RiskEventSink>>,
}

impl CircuitBreaker {
    pub fn new(entity: RiskEntity, config: CircuitBreakerConfig) -> Self {
        Self {
            entity,
            config,
            state: Mutex::new(BreakerState::new(Utc::now().date_naive())),
            events: None,
        }
    }

    /// Persist every trip through `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn RiskEventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn entity(&self) -> &RiskEntity {
        &self.entity
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.cooldown).unwrap_or(chrono::Duration::MAX)
    }

    /// End of the cooldown; `None` when it lies beyond the representable range
    fn cooldown_ends(&self, opened_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        opened_at.checked_add_signed(self.cooldown())
    }

    fn cooldown_elapsed(&self, state: &BreakerState, now: DateTime<Utc>) -> bool {
        match state.opened_at {
            Some(opened_at) => self.cooldown_ends(opened_at).is_some_and(|ends| now >= ends),
            None => true,
        }
    }

    /// Record a realized trade result
    pub async fn record_trade(&self, pnl: Decimal, initial_balance: Decimal) -> Result<()> {
        self.record_trade_at(pnl, initial_balance, Utc::now()).await
    }

    /// Record a realized trade result observed at `now`.
    ///
    /// Returns `CircuitBreakerTriggered` when this trade opens the breaker.
    /// Recording into an already open breaker only updates the counters.
    pub async fn record_trade_at(
        &self,
        pnl: Decimal,
        initial_balance: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let trip = {
            let mut state = self.lock();

            let today = now.date_naive();
            if today != state.last_reset_date {
                debug!(entity = %self.entity, "New trading day, daily loss reset");
                state.daily_loss = Decimal::ZERO;
                state.last_reset_date = today;
            }

            if state.is_open && self.cooldown_elapsed(&state, now) {
                info!(entity = %self.entity, "Circuit breaker cooldown elapsed, closing");
                state.is_open = false;
                state.opened_at = None;
                state.consecutive_losses = 0;
            }

            if pnl < Decimal::ZERO {
                state.consecutive_losses += 1;
                state.daily_loss = state
                    .daily_loss
                    .checked_add(pnl.abs())
                    .unwrap_or(Decimal::MAX);
            } else {
                state.consecutive_losses = 0;
            }

            if state.is_open {
                return Ok(());
            }

            let reason = if state.consecutive_losses >= self.config.max_consecutive_losses {
                Some(TripReason::ConsecutiveLosses {
                    count: state.consecutive_losses,
                    max: self.config.max_consecutive_losses,
                })
            } else if initial_balance > Decimal::ZERO {
                // An unrepresentable ratio is past any configured limit
                let loss_pct = state
                    .daily_loss
                    .checked_div(initial_balance)
                    .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
                    .unwrap_or(Decimal::MAX);
                (loss_pct >= self.config.max_daily_loss_pct).then(|| TripReason::DailyLossLimit {
                    loss_pct,
                    max_pct: self.config.max_daily_loss_pct,
                })
            } else {
                None
            };

            reason.map(|reason| {
                state.is_open = true;
                state.opened_at = Some(now);
                state.last_trip_reason = Some(reason.clone());
                state.total_trips += 1;
                (reason, state.clone())
            })
        };

        match trip {
            Some((reason, snapshot)) => {
                warn!(entity = %self.entity, reason = %reason, "Circuit breaker TRIPPED");
                self.persist_trip(&reason, &snapshot, initial_balance).await;
                Err(FleetError::CircuitBreakerTriggered {
                    entity: self.entity.to_string(),
                    reason: reason.to_string(),
                })
            }
            None => Ok(()),
        }
    }

    async fn persist_trip(&self, reason: &TripReason, state: &BreakerState, initial_balance: Decimal) {
        let Some(sink) = &self.events else {
            return;
        };

        let data = serde_json::json!({
            "reason": reason,
            "consecutive_losses": state.consecutive_losses,
            "daily_loss": state.daily_loss,
            "initial_balance": initial_balance,
            "opened_at": state.opened_at,
            "cooldown_secs": self.config.cooldown.as_secs(),
        });
        let entity_id = self.entity.to_string();
        let description = reason.to_string();

        let call = sink.log_risk_event(&entity_id, reason.event_type(), &description, data);
        match tokio::time::timeout(self.config.event_timeout, call).await {
            Ok(Ok(())) => debug!(entity = %self.entity, "Risk event persisted"),
            Ok(Err(e)) => error!(entity = %self.entity, error = %e, "Failed to persist risk event"),
            Err(_) => error!(entity = %self.entity, "Timed out persisting risk event"),
        }
    }

    /// Whether new trades are blocked right now
    pub fn is_open(&self) -> bool {
        self.is_open_at(Utc::now())
    }

    /// Whether new trades are blocked at `now`.
    ///
    /// Reports closed once the cooldown has elapsed; the stored flag is only
    /// cleared by [`close`](Self::close), [`reset`](Self::reset) or the next
    /// recorded trade.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        let state = self.lock();
        state.is_open && !self.cooldown_elapsed(&state, now)
    }

    pub fn state(&self) -> CircuitState {
        if self.is_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Force the breaker open
    pub async fn trip(&self, reason: &str) {
        let snapshot = {
            let mut state = self.lock();
            if state.is_open {
                return;
            }
            let reason = TripReason::Manual {
                reason: reason.to_string(),
            };
            state.is_open = true;
            state.opened_at = Some(Utc::now());
            state.last_trip_reason = Some(reason);
            state.total_trips += 1;
            state.clone()
        };
        let reason = TripReason::Manual {
            reason: reason.to_string(),
        };
        warn!(entity = %self.entity, reason = %reason, "Circuit breaker TRIPPED");
        self.persist_trip(&reason, &snapshot, Decimal::ZERO).await;
    }

    /// Clear the gate and the loss streak; daily loss accounting is kept
    pub fn close(&self) {
        let mut state = self.lock();
        state.is_open = false;
        state.opened_at = None;
        state.consecutive_losses = 0;
        info!(entity = %self.entity, "Circuit breaker CLOSED - trading resumed");
    }

    /// Zero every counter
    pub fn reset(&self) {
        let mut state = self.lock();
        let total_trips = state.total_trips;
        *state = BreakerState::new(Utc::now().date_naive());
        state.total_trips = total_trips;
        info!(entity = %self.entity, "Circuit breaker reset");
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> CircuitBreakerStatus {
        let state = self.lock();
        let is_open = state.is_open && !self.cooldown_elapsed(&state, now);
        let remaining = match (is_open, state.opened_at) {
            (true, Some(opened_at)) => match self.cooldown_ends(opened_at) {
                Some(ends) => (ends - now).num_seconds().max(0) as u64,
                None => u64::MAX,
            },
            _ => 0,
        };

        CircuitBreakerStatus {
            entity: self.entity.to_string(),
            state: if is_open {
                CircuitState::Open
            } else {
                CircuitState::Closed
            },
            is_open,
            consecutive_losses: state.consecutive_losses,
            daily_loss: state.daily_loss,
            opened_at: state.opened_at,
            remaining_cooldown_secs: remaining,
            last_trip_reason: state.last_trip_reason.clone(),
            total_trips: state.total_trips,
        }
    }
}

/// One breaker per entity, created on first use
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    events: Option<Arc<dyn RiskEventSink>>,
    breakers: Mutex<HashMap<RiskEntity, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, events: Option<Arc<dyn RiskEventSink>>) -> Self {
        Self {
            config,
            events,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RiskEntity, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_or_create(&self, entity: &RiskEntity) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(entity.clone())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(entity.clone(), self.config.clone());
                Arc::new(match &self.events {
                    Some(sink) => breaker.with_event_sink(sink.clone()),
                    None => breaker,
                })
            })
            .clone()
    }

    pub fn get(&self, entity: &RiskEntity) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(entity).cloned()
    }

    /// Whether new trades are blocked for the agent or its owning user
    pub fn is_blocked(&self, agent_id: &AgentId, user_id: &str) -> bool {
        let breakers = self.lock();
        [
            RiskEntity::Agent(agent_id.clone()),
            RiskEntity::User(user_id.to_string()),
        ]
        .iter()
        .filter_map(|e| breakers.get(e))
        .any(|b| b.is_open())
    }

    pub fn statuses(&self) -> Vec<CircuitBreakerStatus> {
        let breakers: Vec<_> = self.lock().values().cloned().collect();
        breakers.iter().map(|b| b.status()).collect()
    }

    pub fn open_count(&self) -> usize {
        let breakers: Vec<_> = self.lock().values().cloned().collect();
        breakers.iter().filter(|b| b.is_open()).count()
    }
}
