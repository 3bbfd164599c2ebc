//! Frontend request execution and cooperative cancellation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use hicli_core::{
    BackendCommand, BackendError, BackendErrorCategory, RequestId, RetryPolicy, SyncPayload,
    model::{Event, EventsFetched, RelationType, RoomStateKind, RoomStateResult},
};
use hicli_platform::{EventStore, with_busy_retry};
use hicli_store::{GcPolicy, GlobalStore, RoomStore};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    send::{SendPath, storage_error},
    transport::MatrixTransport,
};

struct InFlightEntry {
    token: CancellationToken,
    reason: Option<String>,
}

/// Cancellation handles of requests still being executed.
#[derive(Clone, Default)]
pub struct InFlight {
    entries: Arc<Mutex<HashMap<RequestId, InFlightEntry>>>,
}

impl InFlight {
    fn entries(&self) -> MutexGuard<'_, HashMap<RequestId, InFlightEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, request_id: RequestId) -> CancellationToken {
        let token = CancellationToken::new();
        self.entries().insert(
            request_id,
            InFlightEntry {
                token: token.clone(),
                reason: None,
            },
        );
        token
    }

    /// Signal cancellation. Returns `false` when the request already finished.
    pub fn cancel(&self, request_id: RequestId, reason: Option<String>) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&request_id) else {
            return false;
        };
        entry.reason = reason;
        entry.token.cancel();
        true
    }

    /// Forget a request and return the reason it was cancelled with, if any.
    pub fn finish(&self, request_id: RequestId) -> Option<String> {
        self.entries()
            .remove(&request_id)
            .and_then(|entry| entry.reason)
    }

    pub fn cancel_all(&self) {
        for entry in self.entries().values() {
            entry.token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

fn to_value(value: &impl Serialize) -> Result<Value, BackendError> {
    serde_json::to_value(value).map_err(|err| {
        BackendError::new(
            BackendErrorCategory::Serialization,
            "serialization_error",
            err.to_string(),
        )
    })
}

/// Clears a room's requested mark for an event unless the fetch completed.
struct EventRequest {
    room: Arc<RoomStore>,
    event_id: String,
    completed: bool,
}

impl Drop for EventRequest {
    fn drop(&mut self) {
        if !self.completed {
            self.room.forget_event_request(&self.event_id);
        }
    }
}

/// Everything a request handler may touch.
pub struct RequestContext {
    pub(crate) send: Arc<SendPath>,
    pub(crate) transport: Arc<dyn MatrixTransport>,
    pub(crate) store: Arc<dyn EventStore>,
    pub(crate) global: Arc<GlobalStore>,
    pub(crate) payload_tx: mpsc::Sender<SyncPayload>,
    pub(crate) gc: GcPolicy,
}

impl RequestContext {
    fn room(&self, room_id: &str) -> Result<Arc<RoomStore>, BackendError> {
        self.global
            .room(room_id)
            .ok_or_else(|| BackendError::room_not_found(room_id))
    }

    async fn push_payload(&self, payload: SyncPayload) -> Result<(), BackendError> {
        self.payload_tx
            .send(payload)
            .await
            .map_err(|_| BackendError::internal("sync pipeline has stopped"))
    }

    pub async fn execute(&self, command: BackendCommand) -> Result<Value, BackendError> {
        match command {
            BackendCommand::SendMessage(params) => to_value(&self.send.send_message(params).await?),
            BackendCommand::SendEvent {
                room_id,
                event_type,
                content,
                synchronous,
            } => to_value(
                &self
                    .send
                    .send_event(&room_id, &event_type, content, synchronous)
                    .await?,
            ),
            BackendCommand::SetState {
                room_id,
                event_type,
                state_key,
                content,
            } => {
                let event_id = self
                    .send
                    .set_state(&room_id, &event_type, &state_key, &content)
                    .await?;
                Ok(json!({ "event_id": event_id }))
            }
            BackendCommand::Resend { transaction_id } => {
                to_value(&self.send.resend(&transaction_id).await?)
            }
            BackendCommand::MarkRead { room_id } => to_value(&self.send.mark_read(&room_id).await?),
            BackendCommand::Paginate { room_id, limit } => self.paginate(&room_id, limit).await,
            BackendCommand::GetRoomState {
                room_id,
                include_members,
            } => self.fetch_room_state(&room_id, include_members).await,
            BackendCommand::GetEvent { room_id, event_id } => {
                self.get_event(&room_id, &event_id).await
            }
            BackendCommand::CollectGarbage { room_id } => self.collect_garbage(&room_id),
            BackendCommand::Cancel { .. } | BackendCommand::Ping { .. } => Err(
                BackendError::invalid_command(format!("{} is not a queued request", command.name())),
            ),
        }
    }

    async fn paginate(&self, room_id: &str, limit: u16) -> Result<Value, BackendError> {
        let room = self.room(room_id)?;
        room.mark_viewed();
        let before = room.oldest_timeline_rowid();
        let page = self.transport.paginate(room_id, before, limit).await?;
        debug!(
            room_id,
            events = page.events.len(),
            has_more = page.has_more,
            "fetched history page"
        );
        let summary = json!({ "events": page.events.len(), "has_more": page.has_more });
        self.push_payload(SyncPayload::Paginated(page)).await?;
        Ok(summary)
    }

    async fn fetch_room_state(
        &self,
        room_id: &str,
        include_members: bool,
    ) -> Result<Value, BackendError> {
        let events = self
            .transport
            .fetch_room_state(room_id, include_members)
            .await?;
        let summary = json!({ "events": events.len() });
        self.push_payload(SyncPayload::RoomState(RoomStateResult {
            room_id: room_id.to_owned(),
            kind: RoomStateKind::Full {
                omit_members: !include_members,
            },
            events,
        }))
        .await?;
        Ok(summary)
    }

    /// Look up one event, falling back to the event store and then the
    /// homeserver. Returns `null` while another fetch for it is in flight.
    async fn get_event(&self, room_id: &str, event_id: &str) -> Result<Value, BackendError> {
        let room = self.room(room_id)?;
        if let Some(event) = room.event_by_id(event_id) {
            return to_value(event.as_ref());
        }
        if !room.mark_event_requested(event_id) {
            debug!(room_id, event_id, "event fetch already in flight");
            return Ok(Value::Null);
        }
        let mut request = EventRequest {
            room: Arc::clone(&room),
            event_id: event_id.to_owned(),
            completed: false,
        };

        let policy = RetryPolicy::storage_busy();
        let stored = with_busy_retry(&policy, "get_event_by_id", || {
            self.store.get_event_by_id(event_id)
        })
        .await
        .map_err(storage_error)?
        .filter(|event| event.room_id == room_id);

        let (event, edits) = match stored {
            Some(event) => self.with_stored_relations(&policy, event).await,
            None => (self.transport.fetch_event(room_id, event_id).await?, Vec::new()),
        };
        debug!(room_id, event_id, edits = edits.len(), "fetched event");
        let result = to_value(&event)?;
        let mut events = vec![event];
        events.extend(edits);
        self.push_payload(SyncPayload::EventsFetched(EventsFetched {
            room_id: room_id.to_owned(),
            events,
        }))
        .await?;
        // Applying the event in the pipeline clears the mark.
        request.completed = true;
        Ok(result)
    }

    /// Attach cached reaction counts and stored edits to an event loaded
    /// from the event store. Lookup failures leave the event bare.
    async fn with_stored_relations(
        &self,
        policy: &RetryPolicy,
        mut event: Event,
    ) -> (Event, Vec<Event>) {
        let counts = with_busy_retry(policy, "get_reaction_counts", || {
            self.store.get_reaction_counts(&event.room_id, &event.id)
        })
        .await;
        match counts {
            Ok(counts) => event.reactions = counts,
            Err(err) => warn!(event_id = %event.id, %err, "failed to count reactions"),
        }
        let edits = with_busy_retry(policy, "get_related_events", || {
            self.store
                .get_related_events(&event.room_id, &event.id, Some(RelationType::Replace))
        })
        .await
        .unwrap_or_else(|err| {
            warn!(event_id = %event.id, %err, "failed to load edits");
            Vec::new()
        });
        (event, edits)
    }

    pub fn collect_garbage(&self, room_id: &str) -> Result<Value, BackendError> {
        let stats = self
            .global
            .collect_garbage(room_id, &self.gc)
            .ok_or_else(|| BackendError::room_not_found(room_id))?;
        to_value(&stats)
    }
}
