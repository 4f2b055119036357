use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{AgentRecord, Order, Position};
use crate::error::Result;

/// Read-only view of one exchange account, as used by the runtime.
///
/// Implementations must honour their own request timeouts; callers
/// additionally bound every call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Current position for `symbol`, `None` when flat
    async fn fetch_position(&self, symbol: &str) -> Result<Option<Position>>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<Order>;
}

/// Builds a client bound to one agent's credentials and venue
#[cfg_attr(test, mockall::automock)]
pub trait ExchangeFactory: Send + Sync {
    fn create_client(&self, agent: &AgentRecord) -> Result<Arc<dyn ExchangeClient>>;
}
