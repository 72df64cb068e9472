use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batch::{BatchAccumulator, BatchConfig};
use crate::error::PipelineError;
use crate::event::{EventCategory, InteractionEvent};
use crate::queue::{DurableLog, PersistedRecord, RecordId};

/// One drained batch handed to the delivery callback.
#[derive(Debug)]
pub struct DrainedBatch {
    pub category: EventCategory,
    pub events: Vec<InteractionEvent>,
}

/// Receives drained batches. Returning an error keeps the batch's
/// persisted records in the durable log for a later recovery pass.
pub trait DeliveryHandler: Send + Sync + 'static {
    fn deliver(&self, batch: DrainedBatch) -> impl Future<Output = anyhow::Result<()>> + Send;
}

struct CoordState {
    batch: BatchAccumulator,
    /// Record ids backing the events currently in the buffer, deleted
    /// only once the delivery callback accepts the drained batch.
    pending: Vec<RecordId>,
    /// Ids already admitted into the buffer, so a recovery pass never
    /// re-admits a live record.
    admitted: HashSet<RecordId>,
    /// Bumped on every drain/reset/reschedule; a timer task only fires
    /// if its generation is still current.
    timer_gen: u64,
}

/// Durable-delivery coordinator for one event category.
///
/// Wraps the in-memory accumulator with write-through persistence:
/// every ingested event is appended to the durable log and the record
/// is acknowledged only after the delivery callback accepts the flush.
/// All batching state is serialized behind one lock; the max-wait timer
/// and explicit flush calls both go through it, so concurrent flushes
/// collapse to one (the second observes an empty buffer).
pub struct Coordinator<H: DeliveryHandler> {
    category: EventCategory,
    log: Arc<dyn DurableLog>,
    handler: Arc<H>,
    state: Arc<Mutex<CoordState>>,
    cancel: CancellationToken,
}

impl<H: DeliveryHandler> Clone for Coordinator<H> {
    fn clone(&self) -> Self {
        Self {
            category: self.category,
            log: Arc::clone(&self.log),
            handler: Arc::clone(&self.handler),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
        }
    }
}

impl<H: DeliveryHandler> Coordinator<H> {
    pub fn new(
        category: EventCategory,
        cfg: BatchConfig,
        log: Arc<dyn DurableLog>,
        handler: Arc<H>,
    ) -> Self {
        Self {
            category,
            log,
            handler,
            state: Arc::new(Mutex::new(CoordState {
                batch: BatchAccumulator::new(cfg),
                pending: Vec::new(),
                admitted: HashSet::new(),
                timer_gen: 0,
            })),
            cancel: CancellationToken::new(),
        }
    }

    pub fn category(&self) -> EventCategory {
        self.category
    }

    /// Combined pending event count.
    pub fn pending_count(&self) -> usize {
        self.state.lock().batch.total()
    }

    /// Records the event in the accumulator and writes it through to
    /// the durable log. Flushes synchronously when the size threshold
    /// is reached, so the next ingest starts a fresh batch.
    pub async fn ingest(&self, event: InteractionEvent) -> Result<(), PipelineError> {
        if event.entity_key().is_empty() {
            return Err(PipelineError::Validation("empty entity key".to_string()));
        }

        let record = PersistedRecord::new(self.category, &event);
        let payload = serde_json::to_vec(&record)
            .map_err(|e| PipelineError::Validation(format!("encoding record: {e}")))?;

        let (flush_due, arm) = {
            let mut state = self.state.lock();

            match self.log.append(&payload) {
                Ok(id) => {
                    state.pending.push(id);
                    state.admitted.insert(id);
                }
                // Persistence failure downgrades this event to
                // in-memory-only; delivery still proceeds.
                Err(e) => warn!(category = %self.category, error = %e, "persisting event"),
            }

            let first = state.batch.add(event);
            let arm = first.then(|| {
                state.timer_gen += 1;
                (state.timer_gen, state.batch.max_wait_time())
            });

            (state.batch.should_flush(Instant::now()), arm)
        };

        if let Some((generation, wait)) = arm {
            self.arm_timer(generation, wait);
        }

        if flush_due {
            self.flush().await;
        }

        Ok(())
    }

    /// Drains the buffer, hands the batch to the delivery callback, and
    /// acknowledges the persisted records only after it accepts.
    ///
    /// Returns the number of events handed off; 0 when the buffer was
    /// already empty or delivery was refused (records then stay in the
    /// log for the next recovery pass).
    pub async fn flush(&self) -> usize {
        let (events, ids) = {
            let mut state = self.state.lock();
            if state.batch.is_empty() {
                return 0;
            }
            state.timer_gen += 1;
            let events = state.batch.drain();
            let ids = std::mem::take(&mut state.pending);
            (events, ids)
        };

        let count = events.len();
        debug!(category = %self.category, count, "flushing batch");

        let batch = DrainedBatch {
            category: self.category,
            events,
        };

        match self.handler.deliver(batch).await {
            Ok(()) => {
                for id in &ids {
                    if let Err(e) = self.log.delete(*id) {
                        warn!(category = %self.category, record = id, error = %e, "deleting record");
                    }
                }
                let mut state = self.state.lock();
                for id in &ids {
                    state.admitted.remove(id);
                }
                count
            }
            Err(e) => {
                warn!(
                    category = %self.category,
                    count,
                    error = %e,
                    "delivery refused, keeping persisted records",
                );
                // Make the records eligible for a future recovery pass.
                let mut state = self.state.lock();
                for id in &ids {
                    state.admitted.remove(id);
                }
                0
            }
        }
    }

    /// Re-admits every persisted record not yet acknowledged, exactly
    /// once per stable id. Returns the number of events re-admitted.
    ///
    /// Run at startup before any new flush is honored; may also run
    /// mid-flight after a refused delivery (e.g. consent granted).
    pub fn recover(&self) -> usize {
        let records = match self.log.enumerate() {
            Ok(records) => records,
            Err(e) => {
                warn!(category = %self.category, error = %e, "enumerating durable log");
                return 0;
            }
        };

        let mut state = self.state.lock();
        let mut admitted = 0;

        for (id, payload) in records {
            if state.admitted.contains(&id) {
                continue;
            }

            let record: PersistedRecord = match serde_json::from_slice(&payload) {
                Ok(record) => record,
                Err(e) => {
                    // Data loss for this one record only.
                    warn!(category = %self.category, record = id, error = %e, "corrupt record, dropping");
                    if let Err(e) = self.log.delete(id) {
                        warn!(record = id, error = %e, "deleting corrupt record");
                    }
                    continue;
                }
            };

            let first = state.batch.add(record.event);
            state.pending.push(id);
            state.admitted.insert(id);
            admitted += 1;

            if first {
                state.timer_gen += 1;
                let generation = state.timer_gen;
                let wait = state.batch.max_wait_time();
                // Arm outside the loop is not needed; one timer per
                // first admit is enough.
                drop(state);
                self.arm_timer(generation, wait);
                state = self.state.lock();
            }
        }

        if admitted > 0 {
            debug!(category = %self.category, admitted, "recovered persisted events");
        }

        admitted
    }

    /// Discards pending in-memory and on-disk state without invoking
    /// the delivery callback. Used when the user revokes consent.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.timer_gen += 1;
            state.batch.reset();
            state.pending.clear();
            state.admitted.clear();
        }

        match self.log.enumerate() {
            Ok(records) => {
                for (id, _) in records {
                    if let Err(e) = self.log.delete(id) {
                        warn!(record = id, error = %e, "deleting cleared record");
                    }
                }
            }
            Err(e) => warn!(category = %self.category, error = %e, "enumerating log for clear"),
        }

        debug!(category = %self.category, "cleared pending state");
    }

    /// Applies new batching thresholds at runtime. A shrunken size
    /// threshold below the pending count flushes immediately; a changed
    /// wait interval is rescheduled from now.
    pub async fn update_config(&self, cfg: BatchConfig) {
        let (flush_due, rearm) = {
            let mut state = self.state.lock();
            let outcome = state.batch.apply_config(cfg);
            let rearm = outcome.rearm.map(|wait| {
                state.timer_gen += 1;
                (state.timer_gen, wait)
            });
            (outcome.flush_due, rearm)
        };

        if let Some((generation, wait)) = rearm {
            self.arm_timer(generation, wait);
        }

        if flush_due {
            self.flush().await;
        }
    }

    /// Explicit lifecycle hook: cancels timers and flushes what is
    /// left. Deinit-triggered flushes are not a portable guarantee.
    pub async fn shutdown(&self) -> usize {
        self.cancel.cancel();
        self.flush().await
    }

    /// Arms a one-shot max-wait timer. The timer only fires while its
    /// generation is current, so drains and reschedules disarm it.
    fn arm_timer(&self, generation: u64, wait: std::time::Duration) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = coordinator.cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            let due = {
                let state = coordinator.state.lock();
                state.timer_gen == generation && !state.batch.is_empty()
            };

            if due {
                debug!(category = %coordinator.category, "max wait reached, flushing");
                coordinator.flush().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::event::InteractionKind;
    use crate::queue::MemoryLog;

    struct RecordingHandler {
        batches: Mutex<Vec<DrainedBatch>>,
        fail: AtomicBool,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }

        fn delivered_events(&self) -> usize {
            self.batches.lock().iter().map(|b| b.events.len()).sum()
        }
    }

    impl DeliveryHandler for RecordingHandler {
        async fn deliver(&self, batch: DrainedBatch) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("downstream refused");
            }
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    fn view(identifier: &str) -> InteractionEvent {
        InteractionEvent::new(
            EventCategory::Asset,
            InteractionKind::View,
            identifier,
            None,
            None,
        )
        .expect("valid event")
    }

    fn coordinator(
        max: usize,
        wait: Duration,
        log: Arc<MemoryLog>,
        handler: Arc<RecordingHandler>,
    ) -> Coordinator<RecordingHandler> {
        Coordinator::new(
            EventCategory::Asset,
            BatchConfig {
                max_batch_size: max,
                max_wait_time: wait,
            },
            log as Arc<dyn DurableLog>,
            handler,
        )
    }

    #[tokio::test]
    async fn test_size_threshold_flushes_and_acknowledges() {
        let log = Arc::new(MemoryLog::new());
        let handler = Arc::new(RecordingHandler::new());
        let coord = coordinator(2, Duration::from_secs(60), log.clone(), handler.clone());

        coord.ingest(view("a.jpg")).await.expect("ingest");
        assert_eq!(log.len(), 1);
        assert!(handler.batches.lock().is_empty());

        coord.ingest(view("b.jpg")).await.expect("ingest");

        let batches = handler.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].events.len(), 2);
        drop(batches);

        // Records acknowledged only after the callback accepted.
        assert!(log.is_empty());
        assert_eq!(coord.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_flushes_without_further_traffic() {
        let log = Arc::new(MemoryLog::new());
        let handler = Arc::new(RecordingHandler::new());
        let coord = coordinator(100, Duration::from_secs(1), log.clone(), handler.clone());

        coord.ingest(view("a.jpg")).await.expect("ingest");
        assert!(handler.batches.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(handler.delivered_events(), 1);
        assert!(log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_timer_does_not_fire() {
        let log = Arc::new(MemoryLog::new());
        let handler = Arc::new(RecordingHandler::new());
        let coord = coordinator(2, Duration::from_secs(1), log.clone(), handler.clone());

        coord.ingest(view("a.jpg")).await.expect("ingest");
        coord.ingest(view("b.jpg")).await.expect("ingest");
        assert_eq!(handler.batches.lock().len(), 1);

        // A new batch after the size flush; the old timer is stale.
        coord.ingest(view("c.jpg")).await.expect("ingest");
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let batches = handler.batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].events.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_flush_collapses() {
        let log = Arc::new(MemoryLog::new());
        let handler = Arc::new(RecordingHandler::new());
        let coord = coordinator(100, Duration::from_secs(60), log.clone(), handler.clone());

        coord.ingest(view("a.jpg")).await.expect("ingest");

        let first = coord.flush().await;
        let second = coord.flush().await;

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(handler.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_records_for_recovery() {
        let log = Arc::new(MemoryLog::new());
        let handler = Arc::new(RecordingHandler::new());
        let coord = coordinator(100, Duration::from_secs(60), log.clone(), handler.clone());

        coord.ingest(view("a.jpg")).await.expect("ingest");
        coord.ingest(view("b.jpg")).await.expect("ingest");

        handler.fail.store(true, Ordering::SeqCst);
        assert_eq!(coord.flush().await, 0);
        assert_eq!(log.len(), 2);

        // A recovery pass re-admits the refused events exactly once.
        handler.fail.store(false, Ordering::SeqCst);
        assert_eq!(coord.recover(), 2);
        assert_eq!(coord.flush().await, 2);
        assert_eq!(handler.delivered_events(), 2);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_after_restart_is_exactly_once() {
        let log = Arc::new(MemoryLog::new());

        {
            let handler = Arc::new(RecordingHandler::new());
            let coord = coordinator(100, Duration::from_secs(60), log.clone(), handler.clone());
            for i in 0..5 {
                coord.ingest(view(&format!("{i}.jpg"))).await.expect("ingest");
            }
            // Process dies here: no flush, no shutdown.
        }

        assert_eq!(log.len(), 5);

        let handler = Arc::new(RecordingHandler::new());
        let coord = coordinator(100, Duration::from_secs(60), log.clone(), handler.clone());

        assert_eq!(coord.recover(), 5);
        // A second recovery pass is a no-op: dedup by stable id.
        assert_eq!(coord.recover(), 0);

        assert_eq!(coord.flush().await, 5);
        assert_eq!(handler.delivered_events(), 5);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_skips_corrupt_records() {
        let log = Arc::new(MemoryLog::new());
        log.append(b"garbage").expect("append");

        let handler = Arc::new(RecordingHandler::new());
        let coord = coordinator(100, Duration::from_secs(60), log.clone(), handler.clone());
        coord.ingest(view("a.jpg")).await.expect("ingest");

        // Only the corrupt sibling is dropped.
        assert_eq!(coord.recover(), 0);
        assert_eq!(coord.flush().await, 1);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_clear_discards_without_delivery() {
        let log = Arc::new(MemoryLog::new());
        let handler = Arc::new(RecordingHandler::new());
        let coord = coordinator(100, Duration::from_secs(60), log.clone(), handler.clone());

        coord.ingest(view("a.jpg")).await.expect("ingest");
        coord.clear();

        assert!(log.is_empty());
        assert_eq!(coord.pending_count(), 0);
        assert_eq!(coord.flush().await, 0);
        assert!(handler.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shrinking_batch_size_flushes_pending() {
        let log = Arc::new(MemoryLog::new());
        let handler = Arc::new(RecordingHandler::new());
        let coord = coordinator(10, Duration::from_secs(60), log.clone(), handler.clone());

        for i in 0..4 {
            coord.ingest(view(&format!("{i}.jpg"))).await.expect("ingest");
        }
        assert!(handler.batches.lock().is_empty());

        coord
            .update_config(BatchConfig {
                max_batch_size: 2,
                max_wait_time: Duration::from_secs(60),
            })
            .await;

        assert_eq!(handler.delivered_events(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_interval_change_reschedules_from_now() {
        let log = Arc::new(MemoryLog::new());
        let handler = Arc::new(RecordingHandler::new());
        let coord = coordinator(100, Duration::from_secs(10), log.clone(), handler.clone());

        coord.ingest(view("a.jpg")).await.expect("ingest");
        tokio::time::sleep(Duration::from_secs(8)).await;

        // Shorter interval, measured from now rather than first add.
        coord
            .update_config(BatchConfig {
                max_batch_size: 100,
                max_wait_time: Duration::from_secs(5),
            })
            .await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(handler.batches.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(handler.delivered_events(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remaining() {
        let log = Arc::new(MemoryLog::new());
        let handler = Arc::new(RecordingHandler::new());
        let coord = coordinator(100, Duration::from_secs(60), log.clone(), handler.clone());

        coord.ingest(view("a.jpg")).await.expect("ingest");
        assert_eq!(coord.shutdown().await, 1);
        assert!(log.is_empty());
    }
}
