//! Persistence interface behind the send path, plus an in-memory implementation.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU32, Ordering},
    },
};

use hicli_core::{
    RetryPolicy,
    model::{Event, EventRowId, RelationType},
};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transient lock contention. Safe to retry.
    #[error("database is busy")]
    Busy,
    #[error("{0} not found")]
    NotFound(String),
    #[error("event store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// Synchronous persistence operations used by the send path and event lookups.
///
/// Calls are expected to be short; implementations report lock contention as
/// [`StoreError::Busy`] and callers retry through [`with_busy_retry`].
pub trait EventStore: Send + Sync {
    /// Store a new event and return it with its assigned row ID.
    fn insert_event(&self, event: Event) -> Result<Event, StoreError>;

    fn get_event_by_rowid(&self, rowid: EventRowId) -> Result<Option<Event>, StoreError>;

    fn get_event_by_id(&self, event_id: &str) -> Result<Option<Event>, StoreError>;

    fn get_event_by_transaction_id(&self, transaction_id: &str)
    -> Result<Option<Event>, StoreError>;

    fn update_event_id(&self, rowid: EventRowId, event_id: &str) -> Result<(), StoreError>;

    fn update_send_error(&self, rowid: EventRowId, error: Option<&str>) -> Result<(), StoreError>;

    /// Replace the ciphertext of an outgoing encrypted event.
    fn update_encrypted_content(&self, rowid: EventRowId, content: &Value)
    -> Result<(), StoreError>;

    /// Events relating to `target_event_id`, optionally of one relation type.
    fn get_related_events(
        &self,
        room_id: &str,
        target_event_id: &str,
        relation_type: Option<RelationType>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Count annotations on an event and cache the result on its row.
    fn get_reaction_counts(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<BTreeMap<String, i64>, StoreError>;
}

/// Run `operation`, retrying with backoff while the store reports busy.
pub async fn with_busy_retry<T>(
    policy: &RetryPolicy,
    name: &str,
    mut operation: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt = 0;
    loop {
        match operation() {
            Err(err) if err.is_busy() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt, None);
                debug!(operation = name, attempt, ?delay, "event store busy, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[derive(Default)]
struct MemoryData {
    next_rowid: i64,
    events: BTreeMap<EventRowId, Event>,
    by_id: HashMap<String, EventRowId>,
    by_transaction_id: HashMap<String, EventRowId>,
}

impl MemoryData {
    fn index(&mut self, event: Event) -> Event {
        self.by_id.insert(event.id.clone(), event.rowid);
        if let Some(txn) = &event.transaction_id {
            self.by_transaction_id.insert(txn.clone(), event.rowid);
        }
        self.events.insert(event.rowid, event.clone());
        event
    }

    fn event_mut(&mut self, rowid: EventRowId) -> Result<&mut Event, StoreError> {
        self.events
            .get_mut(&rowid)
            .ok_or_else(|| StoreError::NotFound(format!("event row {}", rowid.0)))
    }
}

/// Event store kept entirely in memory. Used by tests and the smoke app.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    data: Arc<RwLock<MemoryData>>,
    injected_busy: Arc<AtomicU32>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with [`StoreError::Busy`].
    pub fn inject_busy(&self, count: u32) {
        self.injected_busy.store(count, Ordering::SeqCst);
    }

    fn check_busy(&self) -> Result<(), StoreError> {
        let remaining = self
            .injected_busy
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(StoreError::Busy),
            Err(_) => Ok(()),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryData) -> T) -> Result<T, StoreError> {
        self.check_busy()?;
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        Ok(f(&data))
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut MemoryData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_busy()?;
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        f(&mut data)
    }
}

impl EventStore for InMemoryEventStore {
    fn insert_event(&self, mut event: Event) -> Result<Event, StoreError> {
        self.write(|data| {
            data.next_rowid += 1;
            event.rowid = EventRowId(data.next_rowid);
            event.last_edit = None;
            Ok(data.index(event))
        })
    }

    fn get_event_by_rowid(&self, rowid: EventRowId) -> Result<Option<Event>, StoreError> {
        self.read(|data| data.events.get(&rowid).cloned())
    }

    fn get_event_by_id(&self, event_id: &str) -> Result<Option<Event>, StoreError> {
        self.read(|data| {
            data.by_id
                .get(event_id)
                .and_then(|rowid| data.events.get(rowid))
                .cloned()
        })
    }

    fn get_event_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Event>, StoreError> {
        self.read(|data| {
            data.by_transaction_id
                .get(transaction_id)
                .and_then(|rowid| data.events.get(rowid))
                .cloned()
        })
    }

    fn update_event_id(&self, rowid: EventRowId, event_id: &str) -> Result<(), StoreError> {
        self.write(|data| {
            let event = data.event_mut(rowid)?;
            let old_id = std::mem::replace(&mut event.id, event_id.to_owned());
            event.send_error = None;
            data.by_id.remove(&old_id);
            data.by_id.insert(event_id.to_owned(), rowid);
            Ok(())
        })
    }

    fn update_send_error(&self, rowid: EventRowId, error: Option<&str>) -> Result<(), StoreError> {
        self.write(|data| {
            data.event_mut(rowid)?.send_error = error.map(ToOwned::to_owned);
            Ok(())
        })
    }

    fn update_encrypted_content(
        &self,
        rowid: EventRowId,
        content: &Value,
    ) -> Result<(), StoreError> {
        self.write(|data| {
            data.event_mut(rowid)?.content = content.clone();
            Ok(())
        })
    }

    fn get_related_events(
        &self,
        room_id: &str,
        target_event_id: &str,
        relation_type: Option<RelationType>,
    ) -> Result<Vec<Event>, StoreError> {
        self.read(|data| {
            data.events
                .values()
                .filter(|event| {
                    event.room_id == room_id
                        && event.relates_to.as_deref() == Some(target_event_id)
                        && relation_type.is_none_or(|wanted| event.relation_type == Some(wanted))
                })
                .cloned()
                .collect()
        })
    }

    fn get_reaction_counts(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<BTreeMap<String, i64>, StoreError> {
        self.write(|data| {
            let mut counts = BTreeMap::new();
            for event in data.events.values() {
                if event.room_id != room_id
                    || event.relates_to.as_deref() != Some(event_id)
                    || event.relation_type != Some(RelationType::Annotation)
                    || event.redacted_by.is_some()
                {
                    continue;
                }
                if let Some(key) = &event.reaction_key {
                    *counts.entry(key.clone()).or_insert(0) += 1;
                }
            }
            if let Some(rowid) = data.by_id.get(event_id).copied()
                && let Some(target) = data.events.get_mut(&rowid)
            {
                target.reactions = counts.clone();
            }
            Ok(counts)
        })
    }
}
