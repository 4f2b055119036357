pub mod memory_lock_store;
pub mod postgres;
pub mod redis_lock_store;

pub use memory_lock_store::MemoryLockStore;
pub use postgres::{PostgresStore, RiskEventRow};
pub use redis_lock_store::RedisLockStore;
