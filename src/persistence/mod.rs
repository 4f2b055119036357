//! Persistence Layer for High-Volume Writes
//!
//! This module provides buffered write infrastructure:
//! - Generic batch writer with size and time triggered flushes
//! - Grouping sinks that turn a batch into per-key bulk inserts
//! - Record types for candles and agent telemetry

pub mod batch_writer;
pub mod records;
pub mod sinks;

pub use batch_writer::{
    BatchSink, BatchWriter, BatchWriterConfig, BatchWriterSnapshot, BatchWriterStats,
};
pub use records::{AgentTelemetry, Candle, TelemetryKind};
pub use sinks::{candle_writer, telemetry_writer, BulkInsert, GroupedSink};
