//! Coordination Layer for replicated agent execution
//!
//! This module provides the ownership and safety infrastructure:
//! - Lock store contract and per-agent distributed locks with renewal
//! - Lock factories (store-backed and always-held stub)
//! - Periodic worker framework with bounded graceful shutdown
//! - Per-entity trading circuit breaker
//! - Process-wide shutdown signalling

pub mod agent_lock;
pub mod circuit_breaker;
pub mod lock_factory;
pub mod lock_store;
pub mod shutdown;
pub mod worker;

pub use agent_lock::{AgentLock, AlwaysHeldLock, StoreAgentLock};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStatus,
    CircuitState, RiskEntity, RiskEventSink, TripReason,
};
pub use lock_factory::{LockFactory, NoopLockFactory, StoreLockFactory};
pub use lock_store::LockStore;
pub use shutdown::{install_signal_handlers, ShutdownManager, ShutdownPhase, ShutdownSignal};
pub use worker::{PeriodicWorker, StopReport, Worker, WorkerGroup, WorkerState};
