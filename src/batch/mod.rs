use std::time::Duration;

use tokio::time::Instant;

use crate::event::{EventCategory, InteractionEvent};

/// Runtime-adjustable batching thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Flush once the combined pending count reaches this size.
    pub max_batch_size: usize,
    /// Flush once the oldest pending event has waited this long.
    pub max_wait_time: Duration,
}

/// Result of applying a configuration change to a non-empty buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigOutcome {
    /// The new size threshold is already exceeded; flush immediately.
    pub flush_due: bool,
    /// The wait timer must be rescheduled to this interval measured
    /// from now, not from the original first-event time.
    pub rearm: Option<Duration>,
}

/// In-memory event buffer with per-category queues.
///
/// Not internally synchronized: the owning coordinator serializes all
/// access behind its lock, so callers never observe a partial update.
#[derive(Debug)]
pub struct BatchAccumulator {
    cfg: BatchConfig,
    assets: Vec<InteractionEvent>,
    experiences: Vec<InteractionEvent>,
    /// Stamped on the first add since the last drain/reset; `None`
    /// exactly when the buffer is empty.
    first_event_at: Option<Instant>,
}

impl BatchAccumulator {
    pub fn new(cfg: BatchConfig) -> Self {
        Self {
            cfg,
            assets: Vec::new(),
            experiences: Vec::new(),
            first_event_at: None,
        }
    }

    /// Appends an event, stamping the first-seen time on the first add.
    ///
    /// Returns true when this was the first event since the last drain,
    /// which is the signal to arm the max-wait timer.
    pub fn add(&mut self, event: InteractionEvent) -> bool {
        let first = self.first_event_at.is_none();
        if first {
            self.first_event_at = Some(Instant::now());
        }

        match event.category {
            EventCategory::Asset => self.assets.push(event),
            EventCategory::Experience => self.experiences.push(event),
        }

        first
    }

    /// Combined pending count across both categories.
    pub fn total(&self) -> usize {
        self.assets.len() + self.experiences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// True once the size threshold or max-wait timeout is reached.
    pub fn should_flush(&self, now: Instant) -> bool {
        if self.total() >= self.cfg.max_batch_size {
            return true;
        }

        match self.first_event_at {
            Some(first) => now.saturating_duration_since(first) >= self.cfg.max_wait_time,
            None => false,
        }
    }

    /// Takes every pending event in input order and resets the
    /// first-seen stamp. Count and stamp reset together.
    pub fn drain(&mut self) -> Vec<InteractionEvent> {
        self.first_event_at = None;
        let mut events = std::mem::take(&mut self.assets);
        events.append(&mut self.experiences);
        events
    }

    /// Discards pending events without handing them to anyone.
    pub fn reset(&mut self) {
        self.assets.clear();
        self.experiences.clear();
        self.first_event_at = None;
    }

    pub fn max_wait_time(&self) -> Duration {
        self.cfg.max_wait_time
    }

    /// Applies a runtime configuration change.
    pub fn apply_config(&mut self, cfg: BatchConfig) -> ConfigOutcome {
        let wait_changed = cfg.max_wait_time != self.cfg.max_wait_time;
        self.cfg = cfg;

        ConfigOutcome {
            flush_due: self.total() >= self.cfg.max_batch_size && !self.is_empty(),
            rearm: (wait_changed && !self.is_empty()).then_some(self.cfg.max_wait_time),
        }
    }
}
