//! Grouping sinks
//!
//! A flushed batch is usually heterogeneous (many symbols, many agents) while
//! the backing tables want one multi-row insert per logical group.
//! [`GroupedSink`] partitions the batch by a composite key and hands every
//! group to a typed [`BulkInsert`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, warn};

use super::batch_writer::{BatchSink, BatchWriter, BatchWriterConfig};
use super::records::{AgentTelemetry, Candle};
use crate::config::BatchConfig;
use crate::error::{FleetError, Result};

/// Typed multi-row insert; returns rows written
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BulkInsert<T: Send + Sync + 'static>: Send + Sync {
    async fn bulk_insert(&self, rows: Vec<T>) -> Result<u64>;
}

pub struct GroupedSink<T, K> {
    name: &'static str,
    key_fn: fn(&T) -> K,
    target: Arc<dyn BulkInsert<T>>,
}

impl<T, K> GroupedSink<T, K>
where
    T: Send + Sync + 'static,
{
    pub fn new(name: &'static str, key_fn: fn(&T) -> K, target: Arc<dyn BulkInsert<T>>) -> Self {
        Self {
            name,
            key_fn,
            target,
        }
    }
}

#[async_trait]
impl<T, K> BatchSink<T> for GroupedSink<T, K>
where
    T: Send + Sync + 'static,
    K: Eq + Hash + Debug + Send + Sync + 'static,
{
    async fn write_batch(&self, batch: Vec<T>) -> Result<()> {
        let mut groups: HashMap<K, Vec<T>> = HashMap::new();
        for record in batch {
            groups.entry((self.key_fn)(&record)).or_default().push(record);
        }

        let total = groups.len();
        let mut failed = 0usize;
        for (key, rows) in groups {
            let count = rows.len();
            match self.target.bulk_insert(rows).await {
                Ok(written) => debug!(sink = self.name, group = ?key, rows = count, written, "Group inserted"),
                Err(e) => {
                    failed += 1;
                    warn!(sink = self.name, group = ?key, rows = count, error = %e, "Group insert failed");
                }
            }
        }

        if failed > 0 {
            return Err(FleetError::Persistence(format!(
                "{}: {} of {} groups failed",
                self.name, failed, total
            )));
        }
        Ok(())
    }
}

/// Candle writer grouped by (symbol, interval)
pub fn candle_writer(target: Arc<dyn BulkInsert<Candle>>, batch: &BatchConfig) -> BatchWriter<Candle> {
    let sink = GroupedSink::new("candles", Candle::group_key, target);
    BatchWriter::new(
        BatchWriterConfig::from_batch_config("candles", batch),
        Arc::new(sink),
    )
}

/// Telemetry writer grouped by (agent, kind)
pub fn telemetry_writer(
    target: Arc<dyn BulkInsert<AgentTelemetry>>,
    batch: &BatchConfig,
) -> BatchWriter<AgentTelemetry> {
    let sink = GroupedSink::new("agent_telemetry", AgentTelemetry::group_key, target);
    BatchWriter::new(
        BatchWriterConfig::from_batch_config("agent_telemetry", batch),
        Arc::new(sink),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AgentId;
    use crate::persistence::records::TelemetryKind;
    use chrono::Utc;
    use mockall::predicate::function;
    use rust_decimal_macros::dec;

    fn candle(symbol: &str, interval: &str) -> Candle {
        Candle {
            symbol: symbol.into(),
            interval: interval.into(),
            open_time: Utc::now(),
            open: dec!(1),
            high: dec!(2),
            low: dec!(0.5),
            close: dec!(1.5),
            volume: dec!(10),
        }
    }

    #[tokio::test]
    async fn test_batch_is_split_per_group() {
        let mut target = MockBulkInsert::<Candle>::new();
        target
            .expect_bulk_insert()
            .with(function(|rows: &Vec<Candle>| {
                rows.len() == 2 && rows.iter().all(|c| c.symbol == "BTCUSDT")
            }))
            .times(1)
            .returning(|rows| Ok(rows.len() as u64));
        target
            .expect_bulk_insert()
            .with(function(|rows: &Vec<Candle>| {
                rows.len() == 1 && rows[0].symbol == "ETHUSDT"
            }))
            .times(1)
            .returning(|rows| Ok(rows.len() as u64));

        let sink = GroupedSink::new("candles", Candle::group_key, Arc::new(target));
        sink.write_batch(vec![
            candle("BTCUSDT", "1m"),
            candle("ETHUSDT", "1m"),
            candle("BTCUSDT", "1m"),
        ])
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_failing_group_does_not_stop_others() {
        let mut target = MockBulkInsert::<AgentTelemetry>::new();
        target
            .expect_bulk_insert()
            .with(function(|rows: &Vec<AgentTelemetry>| rows[0].agent_id.as_str() == "a1"))
            .times(1)
            .returning(|_| Err(FleetError::Persistence("boom".into())));
        target
            .expect_bulk_insert()
            .with(function(|rows: &Vec<AgentTelemetry>| rows[0].agent_id.as_str() == "a2"))
            .times(1)
            .returning(|rows| Ok(rows.len() as u64));

        let sink = GroupedSink::new("agent_telemetry", AgentTelemetry::group_key, Arc::new(target));
        let result = sink
            .write_batch(vec![
                AgentTelemetry::new(AgentId::from("a1"), TelemetryKind::Decision, serde_json::json!({})),
                AgentTelemetry::new(AgentId::from("a2"), TelemetryKind::Decision, serde_json::json!({})),
            ])
            .await;

        assert!(matches!(result, Err(FleetError::Persistence(_))));
    }
}
