mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{agent, CountingDecision, FlatExchangeFactory, MemoryRepository};
use fleetguard::adapters::MemoryLockStore;
use fleetguard::agents::{AgentOrchestrator, Orchestrator, OrchestratorConfig};
use fleetguard::config::LockConfig;
use fleetguard::coordination::{
    CircuitBreakerConfig, CircuitBreakerRegistry, LockFactory, LockStore, StoreLockFactory,
};
use fleetguard::domain::{AgentId, AgentStatus};
use fleetguard::exchange::ExchangeFactory;

fn lock_config() -> LockConfig {
    LockConfig {
        redis_url: "redis://unused".to_string(),
        ttl_secs: 5,
        op_timeout_ms: 50,
        key_prefix: "agent-lock:".to_string(),
    }
}

struct Replica {
    store: MemoryLockStore,
    orchestrator: Arc<AgentOrchestrator>,
    decision: Arc<CountingDecision>,
}

fn replica(
    store: MemoryLockStore,
    repository: Arc<MemoryRepository>,
    ttl: Option<Duration>,
) -> Replica {
    let mut factory = StoreLockFactory::new(
        Arc::new(store.clone()) as Arc<dyn LockStore>,
        &lock_config(),
    );
    if let Some(ttl) = ttl {
        factory = factory.with_ttl(ttl);
    }
    let locks: Arc<dyn LockFactory> = Arc::new(factory);
    let decision = Arc::new(CountingDecision::default());
    let root = CancellationToken::new();
    let orchestrator = Arc::new(AgentOrchestrator::new(
        repository,
        locks,
        decision.clone(),
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), None)),
        OrchestratorConfig {
            tick_interval: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(1),
        },
        &root,
    ));
    Replica {
        store,
        orchestrator,
        decision,
    }
}

fn exchanges() -> Arc<dyn ExchangeFactory> {
    Arc::new(FlatExchangeFactory::default())
}

fn fleet() -> Arc<MemoryRepository> {
    Arc::new(MemoryRepository::with_agents([
        agent("a1", "user-1"),
        agent("a2", "user-1"),
        agent("a3", "user-2"),
    ]))
}

/// Each agent runs on exactly one replica; the other sees it as owned
/// elsewhere, and a repeat pass changes nothing.
#[tokio::test]
async fn agents_run_on_exactly_one_replica() {
    let repository = fleet();
    let backend = MemoryLockStore::new();
    let a = replica(backend.replica("replica-a"), repository.clone(), None);
    let b = replica(backend.replica("replica-b"), repository.clone(), None);
    let cancel = CancellationToken::new();

    let first = a.orchestrator.restore_running_agents(&cancel, exchanges()).await.unwrap();
    assert_eq!((first.desired, first.started), (3, 3));

    let other = b.orchestrator.restore_running_agents(&cancel, exchanges()).await.unwrap();
    assert_eq!(other.started, 0);
    assert_eq!(other.owned_elsewhere, 3);
    assert!(b.orchestrator.is_empty());

    let again = a.orchestrator.restore_running_agents(&cancel, exchanges()).await.unwrap();
    assert_eq!(again.already_running, 3);
    assert_eq!(again.started, 0);
    assert_eq!(again.dropped, 0);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(a.decision.ticks(&AgentId::new("a1")) > 0);
    assert_eq!(b.decision.ticks(&AgentId::new("a1")), 0);

    a.orchestrator.shutdown().await.unwrap();
    b.orchestrator.shutdown().await.unwrap();
}

/// When the owning replica shuts down, the next pass elsewhere takes over.
#[tokio::test]
async fn surviving_replica_takes_over_after_shutdown() {
    let repository = fleet();
    let backend = MemoryLockStore::new();
    let a = replica(backend.replica("replica-a"), repository.clone(), None);
    let b = replica(backend.replica("replica-b"), repository.clone(), None);
    let cancel = CancellationToken::new();

    a.orchestrator.restore_running_agents(&cancel, exchanges()).await.unwrap();
    a.orchestrator.shutdown().await.unwrap();
    assert!(a.orchestrator.running_agents().is_empty());
    assert!(backend.holder("agent-lock:a1").is_none(), "shutdown must release locks");

    let summary = b.orchestrator.restore_running_agents(&cancel, exchanges()).await.unwrap();
    assert_eq!(summary.started, 3);
    assert_eq!(b.store.holder("agent-lock:a2").as_deref(), Some("replica-b"));

    b.orchestrator.shutdown().await.unwrap();
}

/// An agent whose exchange client cannot be built is counted as failed and
/// its lock is handed back.
#[tokio::test]
async fn exchange_failure_releases_the_lock() {
    let repository = fleet();
    let a = replica(MemoryLockStore::new(), repository, None);
    let factory = Arc::new(FlatExchangeFactory::default());
    factory.broken.lock().unwrap().push(AgentId::new("a2"));

    let summary = a
        .orchestrator
        .restore_running_agents(&CancellationToken::new(), factory.clone())
        .await
        .unwrap();

    assert_eq!(summary.started, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    assert!(a.orchestrator.get(&AgentId::new("a2")).is_none());
    assert!(a.store.holder("agent-lock:a2").is_none());

    a.orchestrator.shutdown().await.unwrap();
}

/// Agents no longer desired are stopped and released on the next pass.
#[tokio::test]
async fn stopped_agents_are_dropped() {
    let repository = fleet();
    let a = replica(MemoryLockStore::new(), repository.clone(), None);
    let cancel = CancellationToken::new();

    a.orchestrator.restore_running_agents(&cancel, exchanges()).await.unwrap();
    repository.set_status(&AgentId::new("a3"), AgentStatus::Stopped);

    let summary = a.orchestrator.restore_running_agents(&cancel, exchanges()).await.unwrap();
    assert_eq!(summary.desired, 2);
    assert_eq!(summary.dropped, 1);
    assert_eq!(summary.already_running, 2);
    assert!(a.orchestrator.get(&AgentId::new("a3")).is_none());
    assert!(a.store.holder("agent-lock:a3").is_none());

    a.orchestrator.shutdown().await.unwrap();
}

/// A runtime whose renewal fails stops ticking, and the next pass prunes it
/// and re-acquires once the store is back.
#[tokio::test]
async fn lost_lock_is_pruned_and_reacquired() {
    let repository = Arc::new(MemoryRepository::with_agents([agent("a1", "user-1")]));
    let store = MemoryLockStore::new();
    let a = replica(store.clone(), repository, Some(Duration::from_millis(300)));
    let cancel = CancellationToken::new();

    a.orchestrator.restore_running_agents(&cancel, exchanges()).await.unwrap();
    let first = a.orchestrator.get(&AgentId::new("a1")).unwrap();

    store.set_unavailable(true);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!first.is_lock_held().await);

    let ticks = a.decision.ticks(&AgentId::new("a1"));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(a.decision.ticks(&AgentId::new("a1")), ticks, "no ticks without the lock");

    store.set_unavailable(false);
    let summary = a.orchestrator.restore_running_agents(&cancel, exchanges()).await.unwrap();
    assert_eq!(summary.dropped, 1);
    assert_eq!(summary.started, 1);

    let second = a.orchestrator.get(&AgentId::new("a1")).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.is_lock_held().await);

    a.orchestrator.shutdown().await.unwrap();
}
