mod common;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use common::RecordingBulk;
use fleetguard::config::BatchConfig;
use fleetguard::persistence::{candle_writer, BulkInsert, Candle};

fn candle(symbol: &str, minute: i64) -> Candle {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    Candle {
        symbol: symbol.to_string(),
        interval: "1m".to_string(),
        open_time: base + ChronoDuration::minutes(minute),
        open: Decimal::from(100),
        high: Decimal::from(101),
        low: Decimal::from(99),
        close: Decimal::from(100),
        volume: Decimal::from(5),
    }
}

fn batch_config(max_batch_size: usize, max_wait_ms: u64) -> BatchConfig {
    BatchConfig {
        max_batch_size,
        max_wait_ms,
        flush_timeout_secs: 5,
    }
}

/// Filling the buffer triggers one flush without waiting for the ticker.
#[tokio::test]
async fn full_buffer_flushes_exactly_once() {
    let target = Arc::new(RecordingBulk::<Candle>::default());
    let writer = candle_writer(
        target.clone() as Arc<dyn BulkInsert<Candle>>,
        &batch_config(4, 60_000),
    );

    for minute in 0..4 {
        writer.add(candle("BTCUSDT", minute)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(target.batch_sizes(), vec![4]);
    assert_eq!(writer.pending(), 0);
    let stats = writer.stats();
    assert_eq!(stats.records_added, 4);
    assert_eq!(stats.records_flushed, 4);
    assert_eq!(stats.batches_flushed, 1);

    writer.close().await;
    assert_eq!(target.batch_sizes(), vec![4], "close must not emit an empty batch");
}

/// Close hands over a partial buffer and then refuses new records.
#[tokio::test]
async fn close_flushes_partial_buffer() {
    let target = Arc::new(RecordingBulk::<Candle>::default());
    let writer = candle_writer(
        target.clone() as Arc<dyn BulkInsert<Candle>>,
        &batch_config(100, 60_000),
    );

    for minute in 0..3 {
        writer.add(candle("BTCUSDT", minute)).unwrap();
    }
    assert!(target.batch_sizes().is_empty());

    writer.close().await;
    assert_eq!(target.batch_sizes(), vec![3]);
    assert!(writer.add(candle("BTCUSDT", 9)).is_err());

    // Idempotent
    writer.close().await;
    assert_eq!(target.batch_sizes(), vec![3]);
}

/// Records below the size threshold still go out after `max_wait`.
#[tokio::test]
async fn ticker_flushes_stragglers() {
    let target = Arc::new(RecordingBulk::<Candle>::default());
    let writer = candle_writer(
        target.clone() as Arc<dyn BulkInsert<Candle>>,
        &batch_config(100, 50),
    );

    writer.add(candle("ETHUSDT", 0)).unwrap();
    writer.add(candle("ETHUSDT", 1)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(target.rows().len(), 2);
    writer.close().await;
}

/// One flush is split per (symbol, interval) before reaching storage.
#[tokio::test]
async fn flush_groups_rows_by_series() {
    let target = Arc::new(RecordingBulk::<Candle>::default());
    let writer = candle_writer(
        target.clone() as Arc<dyn BulkInsert<Candle>>,
        &batch_config(100, 60_000),
    );

    writer.add(candle("BTCUSDT", 0)).unwrap();
    writer.add(candle("ETHUSDT", 0)).unwrap();
    writer.add(candle("BTCUSDT", 1)).unwrap();
    writer.close().await;

    let mut sizes = target.batch_sizes();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 2]);
    for batch in target.batches.lock().unwrap().iter() {
        assert!(batch.iter().all(|c| c.symbol == batch[0].symbol));
    }
}
