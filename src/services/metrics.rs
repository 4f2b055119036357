use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::position_monitor::PositionMonitor;
use crate::agents::Orchestrator;
use crate::coordination::{CircuitBreakerRegistry, PeriodicWorker, Worker};
use crate::error::Result;
use crate::persistence::{BatchWriter, BatchWriterSnapshot};

type WriterProbe = Box<dyn Fn() -> BatchWriterSnapshot + Send + Sync>;

/// Point-in-time view of this replica
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetSnapshot {
    pub running_agents: usize,
    pub locks_held: usize,
    pub open_breakers: usize,
    pub tracked_breakers: usize,
    pub closures: u64,
    pub reflections_in_flight: usize,
    pub reflections_failed: u64,
    pub writers: Vec<(String, BatchWriterSnapshot)>,
}

/// Periodic fleet status logger with Prometheus text export
pub struct MetricsReporter {
    orchestrator: Arc<dyn Orchestrator>,
    breakers: Arc<CircuitBreakerRegistry>,
    monitor: Option<Arc<PositionMonitor>>,
    writers: Vec<(String, WriterProbe)>,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        breakers: Arc<CircuitBreakerRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            breakers,
            monitor: None,
            writers: Vec::new(),
            interval,
        }
    }

    pub fn with_position_monitor(mut self, monitor: Arc<PositionMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Report the counters of a batch writer
    pub fn with_writer<T: Send + 'static>(mut self, writer: Arc<BatchWriter<T>>) -> Self {
        let name = writer.name().to_string();
        self.writers.push((name, Box::new(move || writer.stats())));
        self
    }

    pub fn into_periodic(self: Arc<Self>) -> PeriodicWorker {
        let interval = self.interval;
        PeriodicWorker::new(self, interval)
    }

    pub async fn snapshot(&self) -> FleetSnapshot {
        let agents = self.orchestrator.running_agents();
        let mut locks_held = 0;
        for runtime in &agents {
            if runtime.is_lock_held().await {
                locks_held += 1;
            }
        }

        let (closures, reflections_in_flight, reflections_failed) = match &self.monitor {
            Some(monitor) => (
                monitor.stats().closures.load(Ordering::Relaxed),
                monitor.reflections_in_flight(),
                monitor.stats().reflections_failed.load(Ordering::Relaxed),
            ),
            None => (0, 0, 0),
        };

        FleetSnapshot {
            running_agents: agents.len(),
            locks_held,
            open_breakers: self.breakers.open_count(),
            tracked_breakers: self.breakers.statuses().len(),
            closures,
            reflections_in_flight,
            reflections_failed,
            writers: self
                .writers
                .iter()
                .map(|(name, probe)| (name.clone(), probe()))
                .collect(),
        }
    }

    /// Export metrics in Prometheus format
    pub fn prometheus(snapshot: &FleetSnapshot) -> String {
        let mut out = format!(
            r#"# HELP fleet_running_agents Agent runtimes owned by this replica
# TYPE fleet_running_agents gauge
fleet_running_agents {}

# HELP fleet_locks_held Agent locks held locally
# TYPE fleet_locks_held gauge
fleet_locks_held {}

# HELP fleet_open_circuit_breakers Circuit breakers currently blocking trades
# TYPE fleet_open_circuit_breakers gauge
fleet_open_circuit_breakers {}

# HELP fleet_position_closures_total Position closures detected
# TYPE fleet_position_closures_total counter
fleet_position_closures_total {}

# HELP fleet_reflections_in_flight Reflections still running
# TYPE fleet_reflections_in_flight gauge
fleet_reflections_in_flight {}

# HELP fleet_reflections_failed_total Reflections that failed or timed out
# TYPE fleet_reflections_failed_total counter
fleet_reflections_failed_total {}
"#,
            snapshot.running_agents,
            snapshot.locks_held,
            snapshot.open_breakers,
            snapshot.closures,
            snapshot.reflections_in_flight,
            snapshot.reflections_failed,
        );

        if !snapshot.writers.is_empty() {
            out.push_str(
                "\n# HELP fleet_batch_records_flushed_total Records written by batch writers\n\
                 # TYPE fleet_batch_records_flushed_total counter\n",
            );
            for (name, stats) in &snapshot.writers {
                out.push_str(&format!(
                    "fleet_batch_records_flushed_total{{writer=\"{}\"}} {}\n",
                    name, stats.records_flushed
                ));
            }
            out.push_str(
                "\n# HELP fleet_batch_records_dropped_total Records dropped after failed flushes\n\
                 # TYPE fleet_batch_records_dropped_total counter\n",
            );
            for (name, stats) in &snapshot.writers {
                out.push_str(&format!(
                    "fleet_batch_records_dropped_total{{writer=\"{}\"}} {}\n",
                    name, stats.records_dropped
                ));
            }
        }
        out
    }
}

#[async_trait]
impl Worker for MetricsReporter {
    fn name(&self) -> &str {
        "metrics_reporter"
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<()> {
        let s = self.snapshot().await;
        info!(
            running_agents = s.running_agents,
            locks_held = s.locks_held,
            open_breakers = s.open_breakers,
            tracked_breakers = s.tracked_breakers,
            closures = s.closures,
            reflections_in_flight = s.reflections_in_flight,
            "Fleet status"
        );
        for (name, stats) in &s.writers {
            info!(
                writer = %name,
                flushed = stats.records_flushed,
                dropped = stats.records_dropped,
                "Batch writer status"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_lists_writers() {
        let snapshot = FleetSnapshot {
            running_agents: 2,
            locks_held: 2,
            open_breakers: 1,
            writers: vec![(
                "candles".into(),
                BatchWriterSnapshot {
                    records_added: 10,
                    batches_flushed: 1,
                    records_flushed: 10,
                    batches_dropped: 0,
                    records_dropped: 0,
                },
            )],
            ..Default::default()
        };

        let text = MetricsReporter::prometheus(&snapshot);
        assert!(text.contains("fleet_running_agents 2"));
        assert!(text.contains("fleet_open_circuit_breakers 1"));
        assert!(text.contains("fleet_batch_records_flushed_total{writer=\"candles\"} 10"));
    }

    #[test]
    fn test_prometheus_without_writers_has_no_writer_series() {
        let text = MetricsReporter::prometheus(&FleetSnapshot::default());
        assert!(!text.contains("fleet_batch_records"));
    }
}
