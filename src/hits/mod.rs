use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::PipelineError;
use crate::queue::{DurableLog, RecordId};

/// HTTP statuses worth retrying: request timeout, rate limiting, and
/// transient upstream failures.
pub const RECOVERABLE_STATUSES: &[u16] = &[408, 429, 502, 503, 504];

/// Default backoff base interval.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Default backoff cap.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// One pending remote featurization registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturizationHit {
    pub experience_id: String,
    pub org_id: String,
    pub datastream_id: String,
    /// Experience content forwarded verbatim to the registry.
    pub content: serde_json::Value,
    /// Failed delivery attempts so far; drives the backoff interval.
    #[serde(default)]
    pub attempt_count: u32,
}

impl FeaturizationHit {
    /// Rejects hits missing a required downstream identifier.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.experience_id.is_empty() {
            return Err(PipelineError::Configuration(
                "missing experience_id".to_string(),
            ));
        }
        if self.org_id.is_empty() {
            return Err(PipelineError::Configuration("missing org_id".to_string()));
        }
        if self.datastream_id.is_empty() {
            return Err(PipelineError::Configuration(
                "missing datastream_id".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-hit processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitState {
    Pending,
    Checking,
    /// Existence check confirmed the experience is already registered.
    AlreadyRegistered,
    /// Existence check returned 404: not an error, proceed to register
    /// within the same pass.
    NeedsRegister,
    Registering,
    Succeeded,
    RecoverableFailure,
    TerminalFailure,
}

/// Outcome of an existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Exists,
    NotRegistered,
}

/// Errors from the remote registry collaborator.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("decoding response: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RegistryError {
    /// True when a retry has a chance of succeeding.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status(status) => RECOVERABLE_STATUSES.contains(status),
            Self::Decode(_) | Self::Configuration(_) => false,
        }
    }
}

/// Remote existence-check-then-register collaborator.
pub trait RemoteRegistry: Send + Sync + 'static {
    /// Checks whether the experience is already registered. A 404 maps
    /// to `CheckOutcome::NotRegistered`, not an error.
    fn check_exists(
        &self,
        hit: &FeaturizationHit,
    ) -> impl Future<Output = Result<CheckOutcome, RegistryError>> + Send;

    /// Registers the experience content.
    fn register(
        &self,
        hit: &FeaturizationHit,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;
}

/// Exponential backoff: `min(base * 2^attempt_count, cap)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl BackoffPolicy {
    /// Interval before the next attempt, computed from the hit's own
    /// attempt count at failure time.
    pub fn interval(&self, attempt_count: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt_count.min(16)).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }
}

/// Result of one processing pass over a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Remove the hit from the queue: confirmed existence, successful
    /// registration, or a terminal error.
    pub remove: bool,
    /// When to schedule the next attempt, set only on retry.
    pub retry_after: Option<Duration>,
}

impl ProcessOutcome {
    fn done() -> Self {
        Self {
            remove: true,
            retry_after: None,
        }
    }

    fn retry(after: Duration) -> Self {
        Self {
            remove: false,
            retry_after: Some(after),
        }
    }
}

/// Drives one hit through check -> register -> success/retry/drop.
///
/// Safe to invoke concurrently for distinct hits; each hit's
/// check-then-register sequence runs without interleaving.
pub struct HitProcessor<R: RemoteRegistry> {
    registry: Arc<R>,
    backoff: BackoffPolicy,
}

impl<R: RemoteRegistry> HitProcessor<R> {
    pub fn new(registry: Arc<R>, backoff: BackoffPolicy) -> Self {
        Self { registry, backoff }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Processes one hit to a terminal or retry state.
    ///
    /// On a recoverable failure the backoff interval is computed from
    /// the attempt count at failure time, then the count increments so
    /// the next failure backs off further.
    pub async fn process(&self, hit: &mut FeaturizationHit) -> ProcessOutcome {
        if let Err(e) = hit.validate() {
            error!(experience_id = %hit.experience_id, error = %e, "dropping misconfigured hit");
            return ProcessOutcome::done();
        }

        let mut state = HitState::Pending;
        loop {
            state = match state {
                HitState::Pending => HitState::Checking,

                HitState::Checking => match self.registry.check_exists(hit).await {
                    Ok(CheckOutcome::Exists) => HitState::AlreadyRegistered,
                    Ok(CheckOutcome::NotRegistered) => HitState::NeedsRegister,
                    Err(e) => self.failure_state(hit, "existence check", &e),
                },

                HitState::NeedsRegister => HitState::Registering,

                HitState::Registering => match self.registry.register(hit).await {
                    Ok(()) => HitState::Succeeded,
                    Err(e) => self.failure_state(hit, "registration", &e),
                },

                HitState::AlreadyRegistered => {
                    debug!(experience_id = %hit.experience_id, "already registered");
                    return ProcessOutcome::done();
                }

                HitState::Succeeded => {
                    debug!(experience_id = %hit.experience_id, "registered");
                    return ProcessOutcome::done();
                }

                HitState::RecoverableFailure => {
                    let after = self.backoff.interval(hit.attempt_count);
                    hit.attempt_count += 1;
                    return ProcessOutcome::retry(after);
                }

                HitState::TerminalFailure => return ProcessOutcome::done(),
            };
        }
    }

    fn failure_state(&self, hit: &FeaturizationHit, phase: &str, e: &RegistryError) -> HitState {
        if e.is_recoverable() {
            warn!(
                experience_id = %hit.experience_id,
                attempt = hit.attempt_count,
                error = %e,
                "{phase} failed, will retry",
            );
            HitState::RecoverableFailure
        } else {
            error!(experience_id = %hit.experience_id, error = %e, "{phase} failed, dropping hit");
            HitState::TerminalFailure
        }
    }
}

/// Per-pass counters reported by `drain_due`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainStats {
    /// Hits removed from the queue: confirmed existence, successful
    /// registration, or a terminal error.
    pub completed: usize,
    /// Hits rescheduled with backoff.
    pub retried: usize,
    /// Corrupt records dropped without processing.
    pub dropped: usize,
}

/// Durable hit queue driving the processor over persisted hits.
///
/// Decoupled from the interactive batch timing: the owner polls
/// `drain_due` on its own schedule.
pub struct HitQueue<R: RemoteRegistry> {
    log: Arc<dyn DurableLog>,
    processor: HitProcessor<R>,
    /// Earliest next-attempt time per record, from the backoff policy.
    not_before: Mutex<HashMap<RecordId, Instant>>,
}

impl<R: RemoteRegistry> HitQueue<R> {
    pub fn new(log: Arc<dyn DurableLog>, registry: Arc<R>, backoff: BackoffPolicy) -> Self {
        Self {
            log,
            processor: HitProcessor::new(registry, backoff),
            not_before: Mutex::new(HashMap::new()),
        }
    }

    /// Persists a hit for asynchronous registration.
    pub fn submit(&self, hit: &FeaturizationHit) -> Result<RecordId, PipelineError> {
        hit.validate()?;

        let payload = serde_json::to_vec(hit)
            .map_err(|e| PipelineError::Validation(format!("encoding hit: {e}")))?;
        self.log
            .append(&payload)
            .map_err(|e| PipelineError::RecoverableTransport(format!("persisting hit: {e}")))
    }

    /// Processes every persisted hit whose backoff window has elapsed.
    ///
    /// Retried hits are re-persisted with their incremented attempt
    /// count and scheduled `retry_after` from now.
    pub async fn drain_due(&self) -> DrainStats {
        let mut stats = DrainStats::default();

        let records = match self.log.enumerate() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "enumerating hit queue");
                return stats;
            }
        };

        let now = Instant::now();
        for (id, payload) in records {
            if let Some(not_before) = self.not_before.lock().get(&id) {
                if now < *not_before {
                    continue;
                }
            }

            let mut hit: FeaturizationHit = match serde_json::from_slice(&payload) {
                Ok(hit) => hit,
                Err(e) => {
                    // Unrecoverable loss for this one record only.
                    warn!(record = id, error = %e, "corrupt persisted hit, dropping");
                    self.ack(id);
                    stats.dropped += 1;
                    continue;
                }
            };

            let outcome = self.processor.process(&mut hit).await;
            if outcome.remove {
                self.ack(id);
                stats.completed += 1;
            } else {
                self.ack(id);
                match serde_json::to_vec(&hit) {
                    Ok(payload) => match self.log.append(&payload) {
                        Ok(new_id) => {
                            let after = outcome.retry_after.unwrap_or_default();
                            self.not_before.lock().insert(new_id, now + after);
                            stats.retried += 1;
                        }
                        Err(e) => {
                            warn!(error = %e, "re-persisting hit for retry");
                            stats.dropped += 1;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "re-encoding hit for retry");
                        stats.dropped += 1;
                    }
                }
            }
        }

        stats
    }

    /// Number of hits still pending.
    pub fn pending(&self) -> usize {
        self.log.enumerate().map(|r| r.len()).unwrap_or(0)
    }

    fn ack(&self, id: RecordId) {
        if let Err(e) = self.log.delete(id) {
            warn!(record = id, error = %e, "deleting hit record");
        }
        self.not_before.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::queue::MemoryLog;

    /// Scripted registry: pops one response per call.
    #[derive(Default)]
    struct ScriptedRegistry {
        check_responses: Mutex<Vec<Result<CheckOutcome, RegistryError>>>,
        register_responses: Mutex<Vec<Result<(), RegistryError>>>,
        checks: AtomicUsize,
        registrations: AtomicUsize,
    }

    impl RemoteRegistry for ScriptedRegistry {
        async fn check_exists(
            &self,
            _hit: &FeaturizationHit,
        ) -> Result<CheckOutcome, RegistryError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.check_responses
                .lock()
                .pop()
                .unwrap_or(Ok(CheckOutcome::Exists))
        }

        async fn register(&self, _hit: &FeaturizationHit) -> Result<(), RegistryError> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            self.register_responses.lock().pop().unwrap_or(Ok(()))
        }
    }

    fn hit() -> FeaturizationHit {
        FeaturizationHit {
            experience_id: "exp-1".to_string(),
            org_id: "org".to_string(),
            datastream_id: "ds".to_string(),
            content: serde_json::json!({"elements": []}),
            attempt_count: 0,
        }
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let backoff = BackoffPolicy::default();

        let mut previous = Duration::ZERO;
        for attempt in 0..=6 {
            let interval = backoff.interval(attempt);
            assert!(interval >= previous, "attempt {attempt}");
            previous = interval;
        }

        assert_eq!(backoff.interval(0), Duration::from_secs(5));
        assert_eq!(backoff.interval(1), Duration::from_secs(10));
        assert_eq!(backoff.interval(2), Duration::from_secs(20));
        assert_eq!(backoff.interval(6), Duration::from_secs(300));
        assert_eq!(backoff.interval(60), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_already_registered_removes_without_register_call() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry
            .check_responses
            .lock()
            .push(Ok(CheckOutcome::Exists));

        let processor = HitProcessor::new(Arc::clone(&registry), BackoffPolicy::default());
        let outcome = processor.process(&mut hit()).await;

        assert!(outcome.remove);
        assert_eq!(registry.registrations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_registered_registers_in_same_pass() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry
            .check_responses
            .lock()
            .push(Ok(CheckOutcome::NotRegistered));
        registry.register_responses.lock().push(Ok(()));

        let processor = HitProcessor::new(Arc::clone(&registry), BackoffPolicy::default());
        let outcome = processor.process(&mut hit()).await;

        assert!(outcome.remove);
        assert_eq!(registry.checks.load(Ordering::SeqCst), 1);
        assert_eq!(registry.registrations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recoverable_status_schedules_retry() {
        for status in RECOVERABLE_STATUSES {
            let registry = Arc::new(ScriptedRegistry::default());
            registry
                .check_responses
                .lock()
                .push(Err(RegistryError::Status(*status)));

            let processor = HitProcessor::new(Arc::clone(&registry), BackoffPolicy::default());
            let mut hit = hit();
            let outcome = processor.process(&mut hit).await;

            assert!(!outcome.remove, "status {status}");
            assert_eq!(outcome.retry_after, Some(Duration::from_secs(5)));
            assert_eq!(hit.attempt_count, 1);
        }
    }

    #[tokio::test]
    async fn test_terminal_status_drops_hit() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry
            .register_responses
            .lock()
            .push(Err(RegistryError::Status(400)));
        registry
            .check_responses
            .lock()
            .push(Ok(CheckOutcome::NotRegistered));

        let processor = HitProcessor::new(Arc::clone(&registry), BackoffPolicy::default());
        let outcome = processor.process(&mut hit()).await;

        assert!(outcome.remove);
        assert!(outcome.retry_after.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_retries_with_growing_backoff() {
        let registry = Arc::new(ScriptedRegistry::default());
        let processor = HitProcessor::new(Arc::clone(&registry), BackoffPolicy::default());

        let mut hit = hit();
        for expected_secs in [5, 10, 20] {
            registry
                .check_responses
                .lock()
                .push(Err(RegistryError::Transport("connection reset".to_string())));
            let outcome = processor.process(&mut hit).await;
            assert_eq!(
                outcome.retry_after,
                Some(Duration::from_secs(expected_secs))
            );
        }
        assert_eq!(hit.attempt_count, 3);
    }

    #[tokio::test]
    async fn test_misconfigured_hit_dropped_without_remote_calls() {
        let registry = Arc::new(ScriptedRegistry::default());
        let processor = HitProcessor::new(Arc::clone(&registry), BackoffPolicy::default());

        let mut bad = hit();
        bad.datastream_id = String::new();

        let outcome = processor.process(&mut bad).await;
        assert!(outcome.remove);
        assert_eq!(registry.checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_respects_backoff_window() {
        let log = Arc::new(MemoryLog::new());
        let registry = Arc::new(ScriptedRegistry::default());
        registry
            .check_responses
            .lock()
            .push(Err(RegistryError::Status(503)));

        let queue = HitQueue::new(
            log.clone() as Arc<dyn DurableLog>,
            Arc::clone(&registry),
            BackoffPolicy::default(),
        );
        queue.submit(&hit()).expect("submit");

        let stats = queue.drain_due().await;
        assert_eq!(stats.retried, 1);
        assert_eq!(queue.pending(), 1);

        // Still inside the backoff window: no remote call happens.
        let stats = queue.drain_due().await;
        assert_eq!(stats.retried, 0);
        assert_eq!(registry.checks.load(Ordering::SeqCst), 1);

        // Past the window the hit is retried and succeeds.
        tokio::time::advance(Duration::from_secs(6)).await;
        let stats = queue.drain_due().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_hit_record_dropped_alone() {
        let log = Arc::new(MemoryLog::new());
        log.append(b"not json").expect("append");

        let registry = Arc::new(ScriptedRegistry::default());
        let queue = HitQueue::new(
            log.clone() as Arc<dyn DurableLog>,
            registry,
            BackoffPolicy::default(),
        );
        queue.submit(&hit()).expect("submit");

        let stats = queue.drain_due().await;
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_submit_rejects_missing_identifiers() {
        let log = Arc::new(MemoryLog::new());
        let registry = Arc::new(ScriptedRegistry::default());
        let queue = HitQueue::new(log as Arc<dyn DurableLog>, registry, BackoffPolicy::default());

        let mut bad = hit();
        bad.org_id = String::new();
        let err = queue.submit(&bad).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
