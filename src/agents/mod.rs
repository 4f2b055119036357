//! Agent ownership: runtimes owned by this replica
//!
//! The orchestrator restores agents from the repository, acquiring each
//! agent's lock before starting its runtime. Runtimes gate their decision
//! loop on lock ownership and circuit breakers.

pub mod orchestrator;
pub mod runtime;
pub mod traits;

pub use orchestrator::{AgentOrchestrator, OrchestratorConfig};
pub use runtime::{AgentRuntime, PositionTracker};
pub use traits::{AgentRepository, DecisionLoop, Orchestrator, Reflector, RestoreSummary};

#[cfg(test)]
pub use traits::{MockAgentRepository, MockReflector};
