//! Buffered Batch Writer
//!
//! Producers append records; a background task hands accumulated records to a
//! [`BatchSink`] when the buffer reaches `max_batch_size` or every `max_wait`,
//! whichever comes first. A failed or timed-out flush is logged and the batch
//! is dropped; telemetry is not transactionally critical. A clean
//! [`close`](BatchWriter::close) never drops records added before it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BatchConfig;
use crate::coordination::worker::clamp_interval;
use crate::error::{FleetError, Result};

/// Destination of flushed batches
#[async_trait]
pub trait BatchSink<T>: Send + Sync {
    async fn write_batch(&self, batch: Vec<T>) -> Result<()>;
}

/// Configuration for one writer
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    pub name: String,
    pub max_batch_size: usize,
    pub max_wait: Duration,
    pub flush_timeout: Duration,
}

impl BatchWriterConfig {
    pub fn from_batch_config(name: &str, batch: &BatchConfig) -> Self {
        Self {
            name: name.to_string(),
            max_batch_size: batch.max_batch_size.max(1),
            max_wait: Duration::from_millis(batch.max_wait_ms),
            flush_timeout: Duration::from_secs(batch.flush_timeout_secs),
        }
    }
}

/// Writer counters
#[derive(Debug, Default)]
pub struct BatchWriterStats {
    pub records_added: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub records_flushed: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub records_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWriterSnapshot {
    pub records_added: u64,
    pub batches_flushed: u64,
    pub records_flushed: u64,
    pub batches_dropped: u64,
    pub records_dropped: u64,
}

struct Buffer<T> {
    records: Vec<T>,
    closed: bool,
}

struct Inner<T> {
    config: BatchWriterConfig,
    buffer: Mutex<Buffer<T>>,
    sink: Arc<dyn BatchSink<T>>,
    flush_now: Notify,
    stats: BatchWriterStats,
}

impl<T: Send + 'static> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Buffer<T>> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swap the live buffer out and hand it to the sink
    async fn flush(&self) {
        let batch = {
            let mut buffer = self.lock();
            if buffer.records.is_empty() {
                return;
            }
            std::mem::replace(
                &mut buffer.records,
                Vec::with_capacity(self.config.max_batch_size),
            )
        };

        let size = batch.len() as u64;
        let started = Instant::now();
        match tokio::time::timeout(self.config.flush_timeout, self.sink.write_batch(batch)).await {
            Ok(Ok(())) => {
                self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
                self.stats.records_flushed.fetch_add(size, Ordering::Relaxed);
                debug!(
                    writer = %self.config.name,
                    records = size,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Batch flushed"
                );
            }
            Ok(Err(e)) => {
                self.record_drop(size);
                error!(writer = %self.config.name, records = size, error = %e, "Batch flush failed, dropping batch");
            }
            Err(_) => {
                self.record_drop(size);
                error!(
                    writer = %self.config.name,
                    records = size,
                    timeout_secs = self.config.flush_timeout.as_secs(),
                    "Batch flush timed out, dropping batch"
                );
            }
        }
    }

    fn record_drop(&self, size: u64) {
        self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.stats.records_dropped.fetch_add(size, Ordering::Relaxed);
    }
}

async fn flush_loop<T: Send + 'static>(inner: Arc<Inner<T>>, cancel: CancellationToken) {
    let max_wait = inner.config.max_wait;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + max_wait, max_wait);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = inner.flush_now.notified() => {}
        }
        inner.flush().await;
    }

    // Final flush: everything added before close goes out.
    inner.flush().await;
}

/// Type-agnostic buffered writer
pub struct BatchWriter<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    cancel: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl<T: Send + 'static> BatchWriter<T> {
    /// Create the writer and start its background flush loop
    pub fn new(config: BatchWriterConfig, sink: Arc<dyn BatchSink<T>>) -> Self {
        let max_batch_size = config.max_batch_size.max(1);
        let config = BatchWriterConfig {
            max_batch_size,
            max_wait: clamp_interval(config.max_wait),
            ..config
        };
        info!(
            writer = %config.name,
            max_batch_size,
            max_wait_ms = config.max_wait.as_millis() as u64,
            "Batch writer started"
        );

        let inner = Arc::new(Inner {
            config,
            buffer: Mutex::new(Buffer {
                records: Vec::with_capacity(max_batch_size),
                closed: false,
            }),
            sink,
            flush_now: Notify::new(),
            stats: BatchWriterStats::default(),
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(flush_loop(inner.clone(), cancel.clone()));

        Self {
            inner,
            cancel,
            handle: tokio::sync::Mutex::new(Some(handle)),
            closing: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Append a record; never waits on I/O
    pub fn add(&self, record: T) -> Result<()> {
        let full = {
            let mut buffer = self.inner.lock();
            if buffer.closed {
                return Err(FleetError::WriterClosed(self.inner.config.name.clone()));
            }
            buffer.records.push(record);
            buffer.records.len() >= self.inner.config.max_batch_size
        };

        self.inner.stats.records_added.fetch_add(1, Ordering::Relaxed);
        if full {
            self.inner.flush_now.notify_one();
        }
        Ok(())
    }

    /// Ask the background loop to flush without waiting for the ticker
    pub fn request_flush(&self) {
        self.inner.flush_now.notify_one();
    }

    /// Records waiting for the next flush
    pub fn pending(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn stats(&self) -> BatchWriterSnapshot {
        let s = &self.inner.stats;
        BatchWriterSnapshot {
            records_added: s.records_added.load(Ordering::Relaxed),
            batches_flushed: s.batches_flushed.load(Ordering::Relaxed),
            records_flushed: s.records_flushed.load(Ordering::Relaxed),
            batches_dropped: s.batches_dropped.load(Ordering::Relaxed),
            records_dropped: s.records_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the ticker and flush whatever is buffered before returning
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.lock().closed = true;
        self.cancel.cancel();

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(writer = %self.inner.config.name, error = %e, "Flush loop ended abnormally");
                // The loop died before its final flush; do it here.
                self.inner.flush().await;
            }
        }
        info!(writer = %self.inner.config.name, "Batch writer closed");
    }
}

impl<T: Send + 'static> Drop for BatchWriter<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
