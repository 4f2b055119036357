pub mod metrics;
pub mod position_monitor;
pub mod recovery;

pub use metrics::{FleetSnapshot, MetricsReporter};
pub use position_monitor::{PositionMonitor, PositionMonitorConfig, PositionMonitorStats};
pub use recovery::RecoveryWorker;
