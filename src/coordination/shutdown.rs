//! Graceful Shutdown Handler
//!
//! A single root [`CancellationToken`] fans out to every loop in the process
//! (worker groups, lock renewals, batch writers, agent runtimes). The manager
//! also tracks which shutdown phase the runtime is in so operators can see
//! where a slow shutdown is stuck.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown (SIGQUIT) - shortened phases, reflections are not awaited
    Urgent,
}

impl ShutdownSignal {
    /// Share of the configured phase timeout an urgent shutdown gets
    const URGENT_DIVISOR: u32 = 4;

    /// Bound on one shutdown phase under this signal
    pub fn phase_timeout(self, configured: Duration) -> Duration {
        match self {
            ShutdownSignal::Graceful => configured,
            ShutdownSignal::Urgent => configured / Self::URGENT_DIVISOR,
        }
    }

    /// Bound on waiting for in-flight reflections under this signal
    pub fn drain_timeout(self, configured: Duration) -> Duration {
        match self {
            ShutdownSignal::Graceful => configured,
            ShutdownSignal::Urgent => Duration::ZERO,
        }
    }
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Not shutting down
    Running,
    /// Cancelling periodic workers and waiting for them
    StoppingWorkers,
    /// Waiting for in-flight reflections
    DrainingReflections,
    /// Stopping agent runtimes and releasing their locks
    ReleasingAgents,
    /// Final flush of batch writers
    FlushingWriters,
    /// Shutdown complete
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingWorkers => write!(f, "stopping_workers"),
            ShutdownPhase::DrainingReflections => write!(f, "draining_reflections"),
            ShutdownPhase::ReleasingAgents => write!(f, "releasing_agents"),
            ShutdownPhase::FlushingWriters => write!(f, "flushing_writers"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Owner of the process-wide cancellation token
pub struct ShutdownManager {
    token: CancellationToken,
    signal: OnceLock<ShutdownSignal>,
    phase_tx: watch::Sender<ShutdownPhase>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self {
            token: CancellationToken::new(),
            signal: OnceLock::new(),
            phase_tx,
        }
    }

    /// Root token; components derive child tokens from it
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.signal.get().is_some()
    }

    /// The first signal that requested shutdown
    pub fn requested_signal(&self) -> Option<ShutdownSignal> {
        self.signal.get().copied()
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.signal.set(signal).is_err() {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        self.token.cancel();
    }

    pub fn set_phase(&self, phase: ShutdownPhase) {
        self.phase_tx.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Resolve once shutdown has been requested
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper to install OS signal handlers
pub fn install_signal_handlers(shutdown: Arc<ShutdownManager>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown_sigterm = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("Received SIGTERM");
                    shutdown_sigterm.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
            }
        });

        let shutdown_sigquit = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::quit()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    warn!("Received SIGQUIT - urgent shutdown");
                    shutdown_sigquit.request_shutdown(ShutdownSignal::Urgent);
                }
                Err(e) => warn!("Failed to install SIGQUIT handler: {}", e),
            }
        });
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C");
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            }
            Err(e) => warn!("Failed to install Ctrl+C handler: {}", e),
        }
    });
}
