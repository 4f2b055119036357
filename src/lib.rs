pub mod adapters;
pub mod agents;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod observability;
pub mod persistence;
pub mod runtime;
pub mod services;

pub use agents::{
    AgentOrchestrator, AgentRepository, AgentRuntime, DecisionLoop, Orchestrator, Reflector,
    RestoreSummary,
};
pub use config::AppConfig;
pub use coordination::{
    AgentLock, CircuitBreaker, CircuitBreakerRegistry, CircuitState, LockFactory, LockStore,
    ShutdownManager, ShutdownPhase, ShutdownSignal, WorkerGroup,
};
pub use error::{FleetError, Result};
pub use exchange::{ExchangeClient, ExchangeFactory};
pub use persistence::{AgentTelemetry, BatchWriter, BulkInsert, Candle};
pub use runtime::{Collaborators, FleetRuntime, ShutdownReport};
