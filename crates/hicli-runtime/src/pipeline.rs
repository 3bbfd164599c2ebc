//! Routes sync payloads into the stores, strictly in delivery order.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use hicli_core::{
    BackendError, BackendErrorCategory, ConnectionEvent, ConnectionState,
    ConnectionStateMachine, SendOutcome, SyncPayload, normalize_fatal_error,
    normalize_send_outcome,
    model::{RoomStateKind, RoomStateResult, SendComplete},
};
use hicli_store::{GlobalStore, RoomStore};
use tracing::{debug, error, info, warn};

use crate::emitter::EventEmitter;

pub struct Pipeline {
    global: Arc<GlobalStore>,
    emitter: EventEmitter,
    connection: ConnectionStateMachine,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl Pipeline {
    pub fn new(global: Arc<GlobalStore>, emitter: EventEmitter) -> Self {
        Self {
            global,
            emitter,
            connection: ConnectionStateMachine::default(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Apply one payload. A panicking handler is logged and swallowed.
    pub fn dispatch(&mut self, payload: SyncPayload) {
        let kind = payload.kind();
        let room_id = payload.room_id().map(ToOwned::to_owned);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.route(payload)));
        if let Err(panic) = outcome {
            error!(
                kind,
                room_id = room_id.as_deref().unwrap_or_default(),
                panic = panic_message(panic.as_ref()),
                "payload handler panicked, continuing with next payload"
            );
        }
    }

    fn room(&self, room_id: &str, kind: &'static str) -> Option<Arc<RoomStore>> {
        let room = self.global.room(room_id);
        if room.is_none() {
            debug!(room_id, kind, "payload for unknown room ignored");
        }
        room
    }

    fn route(&mut self, payload: SyncPayload) {
        match payload {
            SyncPayload::SyncComplete(sync) => self.global.apply_sync(sync),
            SyncPayload::RoomState(result) => self.apply_room_state(result),
            SyncPayload::EventsDecrypted(result) => {
                let room_id = result.room_id.clone();
                if let Some(room) = self.room(&room_id, "events_decrypted")
                    && room.apply_decrypted(result)
                {
                    self.global.refresh_list_entry(&room_id);
                }
            }
            SyncPayload::SendComplete(complete) => self.apply_send_complete(complete),
            SyncPayload::Typing(typing) => {
                if let Some(room) = self.room(&typing.room_id, "typing") {
                    room.set_typing(typing.user_ids);
                }
            }
            SyncPayload::Paginated(result) => {
                if let Some(room) = self.room(&result.room_id, "paginated") {
                    room.apply_pagination(result);
                }
            }
            SyncPayload::EventsFetched(result) => {
                if let Some(room) = self.room(&result.room_id, "events_fetched") {
                    room.apply_fetched(result);
                }
            }
            SyncPayload::Connection(event) => self.apply_connection(event),
        }
    }

    /// Single state updates need a known room. A full fetch may be the
    /// first thing seen of a room and creates it.
    fn apply_room_state(&self, result: RoomStateResult) {
        match result.kind {
            RoomStateKind::Single => {
                let Some(room) = self.room(&result.room_id, "room_state") else {
                    return;
                };
                for event in result.events {
                    room.apply_state(event);
                }
            }
            RoomStateKind::Full { omit_members } => {
                let room = self.global.room_or_create(&result.room_id);
                room.apply_full_state(result.events, omit_members);
                self.global.refresh_list_entry(&result.room_id);
            }
        }
    }

    fn apply_send_complete(&self, complete: SendComplete) {
        let outcome = SendOutcome::from_send_complete(&complete);
        let room_id = complete.event.room_id.clone();
        let transaction_id = complete.event.transaction_id.clone().unwrap_or_default();
        if let Some(room) = self.room(&room_id, "send_complete") {
            room.apply_send_complete(complete.event);
        }
        self.emitter
            .push(normalize_send_outcome(room_id, transaction_id, outcome));
    }

    fn apply_connection(&mut self, event: ConnectionEvent) {
        match &event {
            ConnectionEvent::Connected { run_id } => info!(run_id, "connected"),
            ConnectionEvent::SyncError {
                message,
                retry_in_ms,
            } => warn!(%message, retry_in_ms, "sync failed"),
            ConnectionEvent::Disconnected {
                reason,
                recoverable,
            } => info!(reason = reason.as_deref(), recoverable, "disconnected"),
            ConnectionEvent::Connecting | ConnectionEvent::InitComplete => {}
        }

        match self.connection.apply(&event) {
            Ok(Some(change)) => self.emitter.push(change),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "ignoring connection event"),
        }

        if let ConnectionEvent::Disconnected {
            reason,
            recoverable: false,
        } = event
        {
            let error = BackendError::new(
                BackendErrorCategory::Network,
                "disconnected",
                reason.unwrap_or_else(|| "connection closed".to_owned()),
            );
            self.emitter.push(normalize_fatal_error(error, false));
        }
    }
}
