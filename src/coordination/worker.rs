//! Periodic Worker Framework
//!
//! Every background process (recovery, position monitoring, metrics) is a
//! [`Worker`] scheduled by a [`PeriodicWorker`] and owned by a [`WorkerGroup`].
//!
//! Registration precondition: `Worker::run` must be cooperatively cancellable
//! at its blocking calls (or cheap to abandon). Shutdown waits a bounded time
//! and then walks away from iterations that are still in flight.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FleetError, Result};

/// A unit of work that can be scheduled periodically
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Lifecycle of a scheduled worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    /// Cancelled, finishing the in-flight iteration
    Draining,
    /// Exited cleanly
    Stopped,
    /// Did not exit before the stop deadline and was abandoned
    TimedOut,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::TimedOut)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::NotStarted => write!(f, "not_started"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Draining => write!(f, "draining"),
            WorkerState::Stopped => write!(f, "stopped"),
            WorkerState::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Shortest period a ticker accepts; zero makes `tokio::time::interval` panic
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub(crate) fn clamp_interval(interval: Duration) -> Duration {
    interval.max(MIN_INTERVAL)
}

/// Counters for one scheduled worker
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub iterations: AtomicU64,
    pub failures: AtomicU64,
}

/// One worker on one interval
pub struct PeriodicWorker {
    worker: Arc<dyn Worker>,
    interval: Duration,
    initial_delay: Duration,
    state_tx: watch::Sender<WorkerState>,
    stats: WorkerStats,
}

impl PeriodicWorker {
    pub fn new(worker: Arc<dyn Worker>, interval: Duration) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::NotStarted);
        Self {
            worker,
            interval: clamp_interval(interval),
            initial_delay: Duration::ZERO,
            state_tx,
            stats: WorkerStats::default(),
        }
    }

    /// Wait once before the very first run
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn name(&self) -> &str {
        self.worker.name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    pub fn iterations(&self) -> u64 {
        self.stats.iterations.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.stats.failures.load(Ordering::Relaxed)
    }

    fn transition(&self, from: &[WorkerState], to: WorkerState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Run the schedule until `cancel` fires.
    ///
    /// The first run happens right away (after the optional initial delay).
    /// Errors are logged and never end the schedule.
    pub async fn run(&self, cancel: CancellationToken) {
        self.transition(&[WorkerState::NotStarted], WorkerState::Running);
        info!(
            worker = self.name(),
            interval_secs = self.interval.as_secs_f64(),
            "Periodic worker started"
        );

        if !self.initial_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish();
                    return;
                }
                _ = tokio::time::sleep(self.initial_delay) => {}
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_once(&cancel).await;
        }

        self.finish();
    }

    async fn run_once(&self, cancel: &CancellationToken) {
        let started = Instant::now();
        self.stats.iterations.fetch_add(1, Ordering::Relaxed);

        match self.worker.run(cancel).await {
            Ok(()) => debug!(
                worker = self.name(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Worker iteration complete"
            ),
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                error!(worker = self.name(), error = %e, "Worker iteration failed");
            }
        }
    }

    fn finish(&self) {
        self.transition(
            &[WorkerState::Running, WorkerState::Draining],
            WorkerState::Stopped,
        );
        info!(worker = self.name(), "Periodic worker stopped");
    }
}

/// Outcome of [`WorkerGroup::stop`]
#[derive(Debug, Clone)]
pub struct StopReport {
    pub outcomes: Vec<(String, WorkerState)>,
    pub elapsed: Duration,
}

impl StopReport {
    pub fn all_stopped(&self) -> bool {
        self.outcomes.iter().all(|(_, s)| *s == WorkerState::Stopped)
    }

    pub fn timed_out(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, s)| *s == WorkerState::TimedOut)
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// Set of periodic workers started and stopped together
pub struct WorkerGroup {
    cancel: CancellationToken,
    workers: Vec<Arc<PeriodicWorker>>,
    handles: Vec<JoinHandle<()>>,
    started: bool,
}

impl WorkerGroup {
    /// Create a group whose shared token is a child of `parent`
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            workers: Vec::new(),
            handles: Vec::new(),
            started: false,
        }
    }

    /// Register a worker; only allowed before [`start`](Self::start)
    pub fn add(&mut self, worker: PeriodicWorker) -> Result<Arc<PeriodicWorker>> {
        if self.started {
            return Err(FleetError::Validation(format!(
                "cannot add worker {} to a started group",
                worker.name()
            )));
        }
        let worker = Arc::new(worker);
        self.workers.push(worker.clone());
        Ok(worker)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Launch every registered worker concurrently
    pub fn start(&mut self) {
        if self.started {
            warn!("Worker group already started");
            return;
        }
        self.started = true;

        for worker in &self.workers {
            let worker = worker.clone();
            let cancel = self.cancel.clone();
            self.handles
                .push(tokio::spawn(async move { worker.run(cancel).await }));
        }
        info!(workers = self.workers.len(), "Worker group started");
    }

    /// Cancel all workers and wait up to `timeout` for them to drain.
    ///
    /// All workers share one deadline, so this returns within `timeout` plus
    /// scheduling slack. Workers still busy at the deadline are abandoned, not
    /// aborted.
    pub async fn stop(&mut self, timeout: Duration) -> StopReport {
        let started = Instant::now();
        self.cancel.cancel();

        for worker in &self.workers {
            worker.transition(&[WorkerState::Running], WorkerState::Draining);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let handles = std::mem::take(&mut self.handles);
        let mut outcomes = Vec::with_capacity(self.workers.len());

        for (worker, mut handle) in self.workers.iter().zip(handles) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(worker = worker.name(), error = %e, "Worker task ended abnormally");
                    worker.transition(
                        &[WorkerState::Running, WorkerState::Draining],
                        WorkerState::Stopped,
                    );
                }
                Err(_) => {
                    worker.transition(
                        &[WorkerState::Running, WorkerState::Draining],
                        WorkerState::TimedOut,
                    );
                    warn!(
                        worker = worker.name(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Worker did not stop in time, abandoning it"
                    );
                }
            }
            outcomes.push((worker.name().to_string(), worker.state()));
        }

        let report = StopReport {
            outcomes,
            elapsed: started.elapsed(),
        };
        info!(
            elapsed_ms = report.elapsed.as_millis() as u64,
            timed_out = report.timed_out().len(),
            "Worker group stopped"
        );
        report
    }

    pub fn states(&self) -> Vec<(String, WorkerState)> {
        self.workers
            .iter()
            .map(|w| (w.name().to_string(), w.state()))
            .collect()
    }

    pub fn workers(&self) -> &[Arc<PeriodicWorker>] {
        &self.workers
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
