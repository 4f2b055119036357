//! Runtime assembly
//!
//! Wires the lock factory, circuit breakers, orchestrator, batch writers and
//! the periodic workers into one process-level handle, and tears them down in
//! a fixed order on shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::agents::{
    AgentOrchestrator, AgentRepository, DecisionLoop, Orchestrator, OrchestratorConfig, Reflector,
};
use crate::config::AppConfig;
use crate::coordination::{
    CircuitBreakerConfig, CircuitBreakerRegistry, LockFactory, LockStore, RiskEventSink,
    ShutdownManager, ShutdownPhase, ShutdownSignal, StopReport, StoreLockFactory, WorkerGroup,
};
use crate::error::{FleetError, Result};
use crate::exchange::ExchangeFactory;
use crate::persistence::{
    candle_writer, telemetry_writer, AgentTelemetry, BatchWriter, BulkInsert, Candle,
};
use crate::services::{MetricsReporter, PositionMonitor, PositionMonitorConfig, RecoveryWorker};

/// External collaborators the runtime is assembled from
pub struct Collaborators {
    pub locks: Arc<dyn LockFactory>,
    pub repository: Arc<dyn AgentRepository>,
    pub exchanges: Arc<dyn ExchangeFactory>,
    pub decision: Arc<dyn DecisionLoop>,
    pub reflector: Arc<dyn Reflector>,
    pub risk_events: Option<Arc<dyn RiskEventSink>>,
    pub candles: Option<Arc<dyn BulkInsert<Candle>>>,
    pub telemetry: Option<Arc<dyn BulkInsert<AgentTelemetry>>>,
}

impl Collaborators {
    /// Lock factory bound to `store` with the configured lease settings
    pub fn store_locks(store: Arc<dyn LockStore>, config: &AppConfig) -> Arc<dyn LockFactory> {
        Arc::new(StoreLockFactory::new(store, &config.lock))
    }
}

/// What happened during shutdown
#[derive(Debug)]
pub struct ShutdownReport {
    /// Signal that started the shutdown
    pub signal: ShutdownSignal,
    pub workers: StopReport,
    pub reflections_drained: bool,
    pub elapsed: Duration,
}

pub struct FleetRuntime {
    config: AppConfig,
    shutdown: Arc<ShutdownManager>,
    orchestrator: Arc<AgentOrchestrator>,
    breakers: Arc<CircuitBreakerRegistry>,
    monitor: Arc<PositionMonitor>,
    recovery: Arc<RecoveryWorker>,
    metrics: Arc<MetricsReporter>,
    workers: tokio::sync::Mutex<WorkerGroup>,
    candles: Option<Arc<BatchWriter<Candle>>>,
    telemetry: Option<Arc<BatchWriter<AgentTelemetry>>>,
}

impl FleetRuntime {
    /// Build every component and start the workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: AppConfig,
        collaborators: Collaborators,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| FleetError::Validation(errors.join("; ")))?;

        let root = shutdown.token();
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::from(&config.risk),
            collaborators.risk_events.clone(),
        ));

        let orchestrator = Arc::new(AgentOrchestrator::new(
            collaborators.repository.clone(),
            collaborators.locks.clone(),
            collaborators.decision.clone(),
            breakers.clone(),
            OrchestratorConfig::from(&config.workers),
            &root,
        ));

        let candles = collaborators
            .candles
            .map(|target| Arc::new(candle_writer(target, &config.batch)));
        let telemetry = collaborators
            .telemetry
            .map(|target| Arc::new(telemetry_writer(target, &config.batch)));

        let mut monitor = PositionMonitor::new(
            orchestrator.clone(),
            collaborators.repository.clone(),
            collaborators.reflector.clone(),
            breakers.clone(),
            PositionMonitorConfig::from(&config),
        );
        if let Some(writer) = &telemetry {
            monitor = monitor.with_telemetry(writer.clone());
        }
        let monitor = Arc::new(monitor);

        let recovery = Arc::new(RecoveryWorker::new(
            orchestrator.clone(),
            collaborators.exchanges.clone(),
        ));

        let mut metrics = MetricsReporter::new(
            orchestrator.clone(),
            breakers.clone(),
            Duration::from_secs(config.workers.metrics_interval_secs),
        )
        .with_position_monitor(monitor.clone());
        if let Some(writer) = &candles {
            metrics = metrics.with_writer(writer.clone());
        }
        if let Some(writer) = &telemetry {
            metrics = metrics.with_writer(writer.clone());
        }
        let metrics = Arc::new(metrics);

        let mut workers = WorkerGroup::new(&root);
        workers.add(recovery.clone().into_periodic(&config.workers))?;
        workers.add(monitor.clone().into_periodic())?;
        workers.add(metrics.clone().into_periodic())?;
        workers.start();

        info!(
            workers = workers.len(),
            lock_ttl_secs = config.lock.ttl_secs,
            "Fleet runtime started"
        );

        Ok(Self {
            config,
            shutdown,
            orchestrator,
            breakers,
            monitor,
            recovery,
            metrics,
            workers: tokio::sync::Mutex::new(workers),
            candles,
            telemetry,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<AgentOrchestrator> {
        &self.orchestrator
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn position_monitor(&self) -> &Arc<PositionMonitor> {
        &self.monitor
    }

    pub fn recovery(&self) -> &Arc<RecoveryWorker> {
        &self.recovery
    }

    pub fn metrics(&self) -> &Arc<MetricsReporter> {
        &self.metrics
    }

    pub fn candle_writer(&self) -> Option<&Arc<BatchWriter<Candle>>> {
        self.candles.as_ref()
    }

    pub fn telemetry_writer(&self) -> Option<&Arc<BatchWriter<AgentTelemetry>>> {
        self.telemetry.as_ref()
    }

    /// Block until a shutdown is requested, then shut down
    pub async fn run_until_shutdown(&self) -> Result<ShutdownReport> {
        self.shutdown.wait_for_shutdown().await;
        self.shutdown().await
    }

    /// Stop workers, drain reflections, release agents, flush writers.
    ///
    /// Every phase is bounded by the configured stop timeout, cut short for an
    /// urgent signal. A slow phase is logged and the next one still runs.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        let started = Instant::now();
        if !self.shutdown.is_shutdown_requested() {
            self.shutdown.request_shutdown(ShutdownSignal::Graceful);
        }
        let signal = self
            .shutdown
            .requested_signal()
            .unwrap_or(ShutdownSignal::Graceful);
        let timeout = signal.phase_timeout(Duration::from_secs(self.config.workers.stop_timeout_secs));

        self.shutdown.set_phase(ShutdownPhase::StoppingWorkers);
        let workers = self.workers.lock().await.stop(timeout).await;
        if !workers.all_stopped() {
            warn!(timed_out = ?workers.timed_out(), "Some workers were abandoned");
        }

        self.shutdown.set_phase(ShutdownPhase::DrainingReflections);
        let reflection_wait = signal
            .drain_timeout(Duration::from_secs(self.config.reflection.timeout_secs))
            .min(timeout);
        let reflections_drained = self.monitor.drain_reflections(reflection_wait).await;

        self.shutdown.set_phase(ShutdownPhase::ReleasingAgents);
        if let Err(e) = self.orchestrator.shutdown().await {
            warn!(error = %e, "Orchestrator shutdown failed");
        }

        self.shutdown.set_phase(ShutdownPhase::FlushingWriters);
        if let Some(writer) = &self.candles {
            writer.close().await;
        }
        if let Some(writer) = &self.telemetry {
            writer.close().await;
        }

        self.shutdown.set_phase(ShutdownPhase::Complete);
        let report = ShutdownReport {
            signal,
            workers,
            reflections_drained,
            elapsed: started.elapsed(),
        };
        info!(elapsed_ms = report.elapsed.as_millis() as u64, "Fleet runtime stopped");
        Ok(report)
    }
}
