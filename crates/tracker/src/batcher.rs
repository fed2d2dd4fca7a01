//! # Event Batching Queue
//!
//! Nagle-style queue in front of leader forwarding: outgoing update
//! entries accumulate until the batch size is reached or the nagle
//! interval elapses, whichever comes first. There is exactly one flusher
//! at a time (a full batch flushes inline on the offering task; the timer
//! only picks up stragglers), so the sink sees max-degree-of-parallelism 1.
//!
//! External callers — checkpoint creation, bulk reconciliation — can
//! suspend flushing through a scoped [`FlushPause`] guard. Suspensions do
//! not nest: a second `suspend` while one guard is live is rejected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dclt_common::{Result, TrackerError};
use dclt_proto::ContentEntry;

/// Destination of flushed batches.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn flush(&self, batch: Vec<ContentEntry>) -> Result<()>;
}

struct BatcherInner {
    sink: Arc<dyn BatchSink>,
    batch_size: usize,
    pending: Mutex<Vec<ContentEntry>>,
    flush_serial: tokio::sync::Mutex<()>,
    suspended: AtomicBool,
    kick: Notify,
    shutdown: CancellationToken,
}

impl BatcherInner {
    /// Drain and deliver whatever is pending. Serialized; a failed batch
    /// is dropped with a warning — the DHT read-through path repairs the
    /// gap lazily.
    async fn flush_now(&self) {
        let _serial = self.flush_serial.lock().await;
        if self.suspended.load(Ordering::SeqCst) {
            return;
        }
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return;
        }
        debug!(entries = batch.len(), "flushing update batch");
        if let Err(e) = self.sink.flush(batch).await {
            warn!(error = %e, "update batch flush failed");
        }
    }
}

/// The batching queue. Cheap to clone via `Arc`.
pub struct EventBatcher {
    inner: Arc<BatcherInner>,
}

impl EventBatcher {
    /// Create the queue and start its nagle timer task.
    pub fn spawn(
        sink: Arc<dyn BatchSink>,
        batch_size: usize,
        nagle_interval: Duration,
    ) -> Arc<Self> {
        let inner = Arc::new(BatcherInner {
            sink,
            batch_size: batch_size.max(1),
            pending: Mutex::new(Vec::new()),
            flush_serial: tokio::sync::Mutex::new(()),
            suspended: AtomicBool::new(false),
            kick: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let timer = inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(nagle_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.shutdown.cancelled() => break,
                    _ = ticker.tick() => timer.flush_now().await,
                    _ = timer.kick.notified() => timer.flush_now().await,
                }
            }
            // final drain so shutdown does not strand accepted entries
            timer.suspended.store(false, Ordering::SeqCst);
            timer.flush_now().await;
        });

        Arc::new(Self { inner })
    }

    /// Accept one entry. Flushes inline when the batch fills and the queue
    /// is not suspended.
    pub async fn offer(&self, entry: ContentEntry) {
        let full = {
            let mut pending = self.inner.pending.lock();
            pending.push(entry);
            pending.len() >= self.inner.batch_size
        };
        if full && !self.inner.suspended.load(Ordering::SeqCst) {
            self.inner.flush_now().await;
        }
    }

    /// Force a flush of whatever is pending.
    pub async fn flush(&self) {
        self.inner.flush_now().await;
    }

    /// Suspend flushing until the returned guard drops. Entries keep
    /// accumulating. A second suspension while one is live is rejected —
    /// suspensions don't nest.
    pub fn suspend(&self) -> Result<FlushPause> {
        if self.inner.suspended.swap(true, Ordering::SeqCst) {
            return Err(TrackerError::permanent(
                "batching queue is already suspended",
            ));
        }
        debug!("batching queue suspended");
        Ok(FlushPause {
            inner: self.inner.clone(),
        })
    }

    /// Entries accepted but not yet flushed.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Stop the timer task; pending entries get one final flush.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

/// Scoped suspension handle; dropping it resumes flushing and kicks the
/// timer so stragglers leave promptly.
pub struct FlushPause {
    inner: Arc<BatcherInner>,
}

impl Drop for FlushPause {
    fn drop(&mut self) {
        self.inner.suspended.store(false, Ordering::SeqCst);
        self.inner.kick.notify_one();
        debug!("batching queue resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dclt_proto::{ChangeStamp, ContentHash, MachineId, StampOperation};

    struct RecordingSink {
        batches: Mutex<Vec<Vec<ContentEntry>>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
            })
        }

        fn batch_count(&self) -> usize {
            self.batches.lock().len()
        }

        fn total_entries(&self) -> usize {
            self.batches.lock().iter().map(Vec::len).sum()
        }
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn flush(&self, batch: Vec<ContentEntry>) -> Result<()> {
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    fn entry(tag: u64) -> ContentEntry {
        ContentEntry::single(
            ContentHash::digest(&tag.to_be_bytes()),
            1,
            MachineId::new(1),
            ChangeStamp::new(1, chrono::Utc::now(), StampOperation::Add),
        )
    }

    #[tokio::test]
    async fn test_full_batch_flushes_inline() {
        let sink = RecordingSink::new();
        let batcher = EventBatcher::spawn(sink.clone(), 3, Duration::from_secs(3600));
        for i in 0..3 {
            batcher.offer(entry(i)).await;
        }
        assert_eq!(sink.batch_count(), 1);
        assert_eq!(sink.total_entries(), 3);
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_partial_batch_waits_for_nagle_interval() {
        let sink = RecordingSink::new();
        let batcher = EventBatcher::spawn(sink.clone(), 100, Duration::from_millis(20));
        batcher.offer(entry(1)).await;
        assert_eq!(sink.batch_count(), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sink.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_suspension_holds_back_full_batches() {
        let sink = RecordingSink::new();
        let batcher = EventBatcher::spawn(sink.clone(), 2, Duration::from_millis(10));
        let pause = batcher.suspend().expect("suspend");
        for i in 0..6 {
            batcher.offer(entry(i)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.batch_count(), 0);
        assert_eq!(batcher.pending_len(), 6);

        drop(pause);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.total_entries(), 6);
    }

    #[tokio::test]
    async fn test_suspensions_do_not_nest() {
        let sink = RecordingSink::new();
        let batcher = EventBatcher::spawn(sink, 2, Duration::from_secs(3600));
        let pause = batcher.suspend().expect("first suspend");
        assert!(batcher.suspend().is_err());
        drop(pause);
        // released: a new suspension is allowed again
        assert!(batcher.suspend().is_ok());
    }

    #[tokio::test]
    async fn test_explicit_flush_drains_partial_batch() {
        let sink = RecordingSink::new();
        let batcher = EventBatcher::spawn(sink.clone(), 100, Duration::from_secs(3600));
        batcher.offer(entry(1)).await;
        batcher.offer(entry(2)).await;
        batcher.flush().await;
        assert_eq!(sink.total_entries(), 2);
    }
}
