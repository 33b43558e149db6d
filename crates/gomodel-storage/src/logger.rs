use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};

use crate::entry::{AuditLogEntry, UsageEntry};
use crate::pricing::PricingTable;
use crate::store::{LogStore, StoreError};

/// Flush as soon as this many entries are batched, regardless of the ticker.
pub const BATCH_FLUSH_THRESHOLD: usize = 100;

/// Deadline for one store write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub buffer_size: usize,
    pub flush_interval: Duration,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Non-blocking ingest in front of a single batch-writing worker task. The
/// channel is the only shared state between request tasks and the worker;
/// when it is full the entry is dropped, never the request.
pub struct BatchLogger<E: Send + 'static> {
    tx: std::sync::Mutex<Option<mpsc::Sender<E>>>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
    partial_writes: Arc<AtomicU64>,
    label: &'static str,
}

impl<E: Send + 'static> BatchLogger<E> {
    pub fn new(label: &'static str, store: Arc<dyn LogStore<E>>, config: LoggerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let partial_writes = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(batch_writer(
            label,
            store,
            rx,
            config.flush_interval,
            partial_writes.clone(),
        ));

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            worker: std::sync::Mutex::new(Some(worker)),
            dropped: Arc::new(AtomicU64::new(0)),
            partial_writes,
            label,
        }
    }

    /// Enqueue without blocking. Drops (with a warning and a counter bump)
    /// when the buffer is full or the logger is closed.
    pub fn write_with(&self, entry: E, describe: impl FnOnce(&E) -> String) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(logger = self.label, "write after close; entry dropped");
            return;
        };
        match tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) | Err(TrySendError::Closed(entry)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    logger = self.label,
                    entry = %describe(&entry),
                    "log buffer full; entry dropped"
                );
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn partial_write_count(&self) -> u64 {
        self.partial_writes.load(Ordering::Relaxed)
    }

    /// Stop ingesting, drain whatever is queued, final-flush, and return.
    pub async fn close(&self) {
        let sender = {
            let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        drop(sender);

        let worker = {
            let mut guard = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

/// The single background task: reads entries, flushes on size or on the
/// ticker, drains on shutdown, and never lets a store failure stop it.
async fn batch_writer<E: Send + 'static>(
    label: &'static str,
    store: Arc<dyn LogStore<E>>,
    mut rx: mpsc::Receiver<E>,
    flush_interval: Duration,
    partial_writes: Arc<AtomicU64>,
) {
    let mut batch: Vec<E> = Vec::with_capacity(BATCH_FLUSH_THRESHOLD);
    let mut ticker = tokio_time::interval(flush_interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(entry) => {
                        batch.push(entry);
                        if batch.len() >= BATCH_FLUSH_THRESHOLD {
                            flush(label, store.as_ref(), &mut batch, &partial_writes).await;
                        }
                    }
                    // All senders dropped and the queue is drained.
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(label, store.as_ref(), &mut batch, &partial_writes).await;
                }
            }
        }
    }

    if !batch.is_empty() {
        flush(label, store.as_ref(), &mut batch, &partial_writes).await;
    }
    if let Err(err) = store.flush().await {
        tracing::warn!(logger = label, %err, "final store flush failed");
    }
}

async fn flush<E>(
    label: &str,
    store: &dyn LogStore<E>,
    batch: &mut Vec<E>,
    partial_writes: &AtomicU64,
) {
    let pending = std::mem::take(batch);
    let result = tokio_time::timeout(WRITE_TIMEOUT, store.write_batch(&pending)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(StoreError::PartialWrite { attempted, failed })) => {
            partial_writes.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                logger = label,
                attempted,
                failed,
                "partial batch write"
            );
        }
        Ok(Err(err)) => {
            tracing::error!(logger = label, entries = pending.len(), %err, "batch write failed");
        }
        Err(_) => {
            tracing::error!(logger = label, entries = pending.len(), "batch write timed out");
        }
    }
}

/// Audit logger: the batch pipeline over audit entries.
pub struct AuditLogger {
    inner: BatchLogger<AuditLogEntry>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn LogStore<AuditLogEntry>>, config: LoggerConfig) -> Self {
        Self {
            inner: BatchLogger::new("audit", store, config),
        }
    }

    pub fn write(&self, entry: AuditLogEntry) {
        self.inner.write_with(entry, |entry| {
            format!(
                "id={} model={}",
                entry.id,
                entry.model.as_deref().unwrap_or("-")
            )
        });
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped_count()
    }

    pub fn partial_write_count(&self) -> u64 {
        self.inner.partial_write_count()
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }
}

/// Usage logger: same pipeline, narrower record, plus cost computation from
/// the pricing table on the way in.
pub struct UsageLogger {
    inner: BatchLogger<UsageEntry>,
    pricing: Option<PricingTable>,
}

impl UsageLogger {
    pub fn new(
        store: Arc<dyn LogStore<UsageEntry>>,
        config: LoggerConfig,
        pricing: Option<PricingTable>,
    ) -> Self {
        Self {
            inner: BatchLogger::new("usage", store, config),
            pricing,
        }
    }

    pub fn write(&self, mut entry: UsageEntry) {
        if let Some(pricing) = &self.pricing {
            pricing.apply(&mut entry);
        }
        self.inner.write_with(entry, |entry| {
            format!("id={} model={}", entry.id, entry.model)
        });
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped_count()
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::pricing::Pricing;

    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<usize>>,
        entries: Mutex<Vec<AuditLogEntry>>,
        flushes: AtomicU64,
    }

    #[async_trait]
    impl LogStore<AuditLogEntry> for RecordingStore {
        async fn write_batch(&self, batch: &[AuditLogEntry]) -> Result<(), StoreError> {
            self.batches.lock().unwrap().push(batch.len());
            self.entries.lock().unwrap().extend_from_slice(batch);
            Ok(())
        }

        async fn flush(&self) -> Result<(), StoreError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingUsageStore {
        entries: Mutex<Vec<UsageEntry>>,
    }

    #[async_trait]
    impl LogStore<UsageEntry> for RecordingUsageStore {
        async fn write_batch(&self, batch: &[UsageEntry]) -> Result<(), StoreError> {
            self.entries.lock().unwrap().extend_from_slice(batch);
            Ok(())
        }
    }

    fn entry(n: usize) -> AuditLogEntry {
        AuditLogEntry::begin(format!("rid-{n}"), "POST", "/v1/chat/completions")
    }

    #[tokio::test]
    async fn close_drains_every_queued_entry() {
        let store = Arc::new(RecordingStore::default());
        let logger = AuditLogger::new(
            store.clone(),
            LoggerConfig {
                buffer_size: 1000,
                flush_interval: Duration::from_secs(3600),
            },
        );

        for n in 0..50 {
            logger.write(entry(n));
        }
        logger.close().await;

        assert_eq!(store.entries.lock().unwrap().len(), 50);
        assert_eq!(store.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(logger.dropped_count(), 0);
    }

    #[tokio::test]
    async fn threshold_triggers_flush_before_the_ticker() {
        let store = Arc::new(RecordingStore::default());
        let logger = AuditLogger::new(
            store.clone(),
            LoggerConfig {
                buffer_size: 1000,
                flush_interval: Duration::from_secs(3600),
            },
        );

        for n in 0..BATCH_FLUSH_THRESHOLD {
            logger.write(entry(n));
        }

        // Give the worker a moment to pull the threshold batch.
        for _ in 0..100 {
            if !store.batches.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.batches.lock().unwrap().first(), Some(&BATCH_FLUSH_THRESHOLD));

        logger.close().await;
    }

    #[tokio::test]
    async fn interval_flushes_partial_batches() {
        let store = Arc::new(RecordingStore::default());
        let logger = AuditLogger::new(
            store.clone(),
            LoggerConfig {
                buffer_size: 16,
                flush_interval: Duration::from_millis(20),
            },
        );

        logger.write(entry(0));
        for _ in 0..100 {
            if !store.entries.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.entries.lock().unwrap().len(), 1);

        logger.close().await;
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        struct StuckStore;
        #[async_trait]
        impl LogStore<AuditLogEntry> for StuckStore {
            async fn write_batch(&self, _batch: &[AuditLogEntry]) -> Result<(), StoreError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let logger = AuditLogger::new(
            Arc::new(StuckStore),
            LoggerConfig {
                buffer_size: 2,
                flush_interval: Duration::from_secs(3600),
            },
        );

        // Single-threaded test runtime: the worker cannot drain between
        // writes, so everything past the buffer capacity drops.
        for n in 0..20 {
            logger.write(entry(n));
        }
        assert_eq!(logger.dropped_count(), 18);
    }

    #[tokio::test]
    async fn partial_write_is_counted_not_fatal() {
        struct PartialStore {
            calls: AtomicU64,
        }
        #[async_trait]
        impl LogStore<AuditLogEntry> for PartialStore {
            async fn write_batch(&self, batch: &[AuditLogEntry]) -> Result<(), StoreError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::PartialWrite {
                    attempted: batch.len(),
                    failed: 1,
                })
            }
        }

        let store = Arc::new(PartialStore {
            calls: AtomicU64::new(0),
        });
        let logger = AuditLogger::new(
            store.clone(),
            LoggerConfig {
                buffer_size: 16,
                flush_interval: Duration::from_millis(10),
            },
        );

        logger.write(entry(0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        logger.write(entry(1));
        logger.close().await;

        assert!(store.calls.load(Ordering::SeqCst) >= 2);
        assert!(logger.partial_write_count() >= 2);
    }

    #[tokio::test]
    async fn usage_logger_prices_entries_on_ingest() {
        let store = Arc::new(RecordingUsageStore::default());
        let mut table = PricingTable::new();
        table.insert(
            "gpt-4",
            "openai",
            Pricing {
                input_per_million: 10.0,
                output_per_million: 20.0,
            },
        );

        let logger = UsageLogger::new(store.clone(), LoggerConfig::default(), Some(table));
        logger.write(
            UsageEntry::new("rid", "resp-1", "gpt-4", "openai", "chat").with_tokens(100, 50, 150),
        );
        logger.close().await;

        let entries = store.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        let expected_input = 100.0 * 10.0 / 1_000_000.0;
        let expected_output = 50.0 * 20.0 / 1_000_000.0;
        assert_eq!(entries[0].input_cost, Some(expected_input));
        assert_eq!(entries[0].total_cost, Some(expected_input + expected_output));
    }
}
