use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{EventCategory, InteractionEvent};

/// Stable identifier assigned by the log on append.
pub type RecordId = u64;

/// Durable representation of one event plus its category tag.
///
/// Written (logically) on ingest, deleted only after its owning event
/// has been confirmed dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub category: EventCategory,
    pub event: InteractionEvent,
    pub persisted_at: DateTime<Utc>,
}

impl PersistedRecord {
    pub fn new(category: EventCategory, event: &InteractionEvent) -> Self {
        Self {
            category,
            event: event.clone(),
            persisted_at: Utc::now(),
        }
    }
}

/// Key-value append-only store with enumerate-and-acknowledge
/// semantics. The storage primitive itself is an external collaborator;
/// this engine only consumes the interface.
pub trait DurableLog: Send + Sync {
    /// Persists an opaque payload and returns its stable identifier.
    fn append(&self, payload: &[u8]) -> Result<RecordId>;

    /// Returns every record not yet deleted, in append order.
    fn enumerate(&self) -> Result<Vec<(RecordId, Vec<u8>)>>;

    /// Acknowledges a record as safe to delete.
    fn delete(&self, id: RecordId) -> Result<()>;
}

/// In-process log used by the default agent wiring and by tests.
///
/// Survives coordinator teardown (it is shared by `Arc`), which is what
/// the crash-recovery tests lean on: a fresh coordinator against the
/// same log must replay everything not yet acknowledged.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: parking_lot::Mutex<BTreeMap<RecordId, Vec<u8>>>,
    next_id: AtomicU64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records not yet deleted.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableLog for MemoryLog {
    fn append(&self, payload: &[u8]) -> Result<RecordId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.records.lock().insert(id, payload.to_vec());
        Ok(id)
    }

    fn enumerate(&self) -> Result<Vec<(RecordId, Vec<u8>)>> {
        Ok(self
            .records
            .lock()
            .iter()
            .map(|(id, payload)| (*id, payload.clone()))
            .collect())
    }

    fn delete(&self, id: RecordId) -> Result<()> {
        self.records.lock().remove(&id);
        Ok(())
    }
}
