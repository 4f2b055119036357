#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use fleetguard::agents::{AgentRepository, AgentRuntime, DecisionLoop, Reflector};
use fleetguard::domain::{
    AgentId, AgentRecord, AgentStatus, Order, OrderStatus, Position, PositionSide, TradeExperience,
};
use fleetguard::error::{FleetError, Result};
use fleetguard::exchange::{ExchangeClient, ExchangeFactory};
use fleetguard::persistence::BulkInsert;

pub fn long(symbol: &str, size: Decimal, unrealized_pnl: Decimal) -> Position {
    Position {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        size,
        entry_price: Decimal::ONE_HUNDRED,
        unrealized_pnl,
    }
}

/// Exchange that replays a fixed sequence of position reads.
///
/// The last entry repeats once the script runs out.
#[derive(Default)]
pub struct ScriptedExchange {
    positions: Mutex<VecDeque<Option<Position>>>,
    last: Mutex<Option<Position>>,
    orders: Mutex<HashMap<String, OrderStatus>>,
    pub position_reads: AtomicU64,
}

impl ScriptedExchange {
    pub fn new(script: Vec<Option<Position>>) -> Self {
        Self {
            positions: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn with_order(self, order_id: &str, status: OrderStatus) -> Self {
        self.orders.lock().unwrap().insert(order_id.to_string(), status);
        self
    }
}

#[async_trait]
impl ExchangeClient for ScriptedExchange {
    async fn fetch_position(&self, _symbol: &str) -> Result<Option<Position>> {
        self.position_reads.fetch_add(1, Ordering::SeqCst);
        let next = self.positions.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = next;
        }
        Ok(last.clone())
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<Order> {
        let status = self
            .orders
            .lock()
            .unwrap()
            .get(order_id)
            .copied()
            .ok_or_else(|| FleetError::Exchange(format!("unknown order {order_id}")))?;
        Ok(Order {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            status,
        })
    }
}

/// Hands out flat exchanges, or fails for agents listed in `broken`
#[derive(Default)]
pub struct FlatExchangeFactory {
    pub broken: Mutex<Vec<AgentId>>,
    pub created: AtomicU64,
}

impl ExchangeFactory for FlatExchangeFactory {
    fn create_client(&self, agent: &AgentRecord) -> Result<Arc<dyn ExchangeClient>> {
        if self.broken.lock().unwrap().contains(&agent.id) {
            return Err(FleetError::Exchange(format!("no credentials for {}", agent.id)));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedExchange::default()))
    }
}

/// Repository shared by every simulated replica
#[derive(Default)]
pub struct MemoryRepository {
    agents: Mutex<HashMap<AgentId, AgentRecord>>,
    pub saves: AtomicU64,
}

impl MemoryRepository {
    pub fn with_agents(records: impl IntoIterator<Item = AgentRecord>) -> Self {
        let repo = Self::default();
        for record in records {
            repo.insert(record);
        }
        repo
    }

    pub fn insert(&self, record: AgentRecord) {
        self.agents.lock().unwrap().insert(record.id.clone(), record);
    }

    pub fn set_status(&self, id: &AgentId, status: AgentStatus) {
        if let Some(record) = self.agents.lock().unwrap().get_mut(id) {
            record.status = status;
        }
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentRecord> {
        self.agents.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl AgentRepository for MemoryRepository {
    async fn list_running_agents(&self) -> Result<Vec<AgentRecord>> {
        let mut running: Vec<AgentRecord> = self
            .agents
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == AgentStatus::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(running)
    }

    async fn save_agent_state(&self, agent: &AgentRecord) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let mut agents = self.agents.lock().unwrap();
        let stored = agents
            .get_mut(&agent.id)
            .ok_or_else(|| FleetError::Persistence(format!("agent {} not found", agent.id)))?;
        stored.current_balance = agent.current_balance;
        stored.realized_pnl = agent.realized_pnl;
        stored.stop_loss_order_id = agent.stop_loss_order_id.clone();
        stored.take_profit_order_id = agent.take_profit_order_id.clone();
        stored.updated_at = agent.updated_at;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReflector {
    pub experiences: Mutex<Vec<TradeExperience>>,
}

impl RecordingReflector {
    pub fn count(&self) -> usize {
        self.experiences.lock().unwrap().len()
    }
}

#[async_trait]
impl Reflector for RecordingReflector {
    async fn reflect(&self, experience: TradeExperience) -> Result<()> {
        self.experiences.lock().unwrap().push(experience);
        Ok(())
    }
}

/// Decision loop that only counts its ticks per agent
#[derive(Default)]
pub struct CountingDecision {
    ticks: Mutex<HashMap<AgentId, u64>>,
}

impl CountingDecision {
    pub fn ticks(&self, id: &AgentId) -> u64 {
        self.ticks.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DecisionLoop for CountingDecision {
    async fn tick(&self, runtime: &AgentRuntime, _cancel: &CancellationToken) -> Result<()> {
        *self.ticks.lock().unwrap().entry(runtime.id().clone()).or_default() += 1;
        Ok(())
    }
}

/// Bulk target that keeps every batch it receives
pub struct RecordingBulk<T> {
    pub batches: Mutex<Vec<Vec<T>>>,
}

impl<T> Default for RecordingBulk<T> {
    fn default() -> Self {
        Self { batches: Mutex::new(Vec::new()) }
    }
}

impl<T: Clone> RecordingBulk<T> {
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn rows(&self) -> Vec<T> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> BulkInsert<T> for RecordingBulk<T> {
    async fn bulk_insert(&self, rows: Vec<T>) -> Result<u64> {
        let n = rows.len() as u64;
        self.batches.lock().unwrap().push(rows);
        Ok(n)
    }
}

pub fn agent(id: &str, user: &str) -> AgentRecord {
    AgentRecord::new(id, user, "BTCUSDT", Decimal::from(1000))
}
