//! Lock store contract
//!
//! The coordination store is the single source of truth for which replica owns
//! an agent. It only has to offer "take this name for a lease" and "give it
//! back"; there is no extend primitive, so renewal is modelled on top of these
//! two calls by [`StoreAgentLock`](super::StoreAgentLock).

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Thin client to an external quorum-capable key/value store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Try to take `name` for `ttl`.
    ///
    /// Returns the remaining lease in milliseconds: positive when the lock was
    /// granted to this caller, zero when another owner holds it. A negative
    /// value is a malformed response and is rejected by callers.
    async fn lock(&self, name: &str, ttl: Duration) -> Result<i64>;

    /// Give `name` back. Only removes the lease when this caller owns it.
    async fn unlock(&self, name: &str) -> Result<()>;
}
