use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::BackendError,
    model::{
        EventsDecrypted, EventsFetched, PaginationResult, RoomStateResult, SendComplete,
        SyncComplete, Typing,
    },
    protocol::Frame,
};

/// Identifier correlating a request with its response.
pub type RequestId = i64;

/// Connection lifecycle as reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No backend connection.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected, waiting for the initial sync to finish.
    Connected,
    /// Initial sync finished and incremental syncs are flowing.
    Syncing,
    /// Sync failed and the backend is retrying.
    Reconnecting,
    /// Connection can not be recovered without user action.
    Fatal,
}

/// Connection lifecycle notification pushed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// A connection attempt started.
    Connecting,
    /// Connection established. `run_id` identifies the backend process run.
    Connected { run_id: String },
    /// The initial sync has been fully applied.
    InitComplete,
    /// A sync request failed; `retry_in_ms` is the backoff before the next one.
    SyncError { message: String, retry_in_ms: u64 },
    /// The connection closed.
    Disconnected {
        reason: Option<String>,
        /// Whether the backend will reconnect on its own.
        recoverable: bool,
    },
}

/// Closed union of payloads the backend pushes into the application
/// pipeline. Each variant is routed to exactly one store handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum SyncPayload {
    /// One processed sync batch.
    SyncComplete(SyncComplete),
    /// Result of a room state fetch.
    RoomState(RoomStateResult),
    /// Decryption finished for previously undecryptable events.
    EventsDecrypted(EventsDecrypted),
    /// Individually fetched events.
    EventsFetched(EventsFetched),
    /// A send attempt finished, successfully or not.
    SendComplete(SendComplete),
    /// Typing notification for one room.
    Typing(Typing),
    /// Page of history fetched by a pagination request.
    Paginated(PaginationResult),
    /// Connection lifecycle notification.
    Connection(ConnectionEvent),
}

impl SyncPayload {
    /// Stable name used in logs and on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncComplete(_) => "sync_complete",
            Self::RoomState(_) => "room_state",
            Self::EventsDecrypted(_) => "events_decrypted",
            Self::EventsFetched(_) => "events_fetched",
            Self::SendComplete(_) => "send_complete",
            Self::Typing(_) => "typing",
            Self::Paginated(_) => "paginated",
            Self::Connection(_) => "connection",
        }
    }

    /// Room the payload targets, when it targets exactly one.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::RoomState(result) => Some(&result.room_id),
            Self::EventsDecrypted(result) => Some(&result.room_id),
            Self::EventsFetched(result) => Some(&result.room_id),
            Self::SendComplete(result) => Some(&result.event.room_id),
            Self::Typing(typing) => Some(&typing.room_id),
            Self::Paginated(result) => Some(&result.room_id),
            Self::SyncComplete(_) | Self::Connection(_) => None,
        }
    }
}

/// User mentions attached to an outgoing message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mentions {
    /// Mentioned user IDs.
    #[serde(default)]
    pub user_ids: Vec<String>,
    /// Whether the whole room is mentioned.
    #[serde(default)]
    pub room: bool,
}

/// Parameters of a composed message send.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SendMessageParams {
    /// Target room ID.
    pub room_id: String,
    /// Raw composer text, possibly starting with a slash command.
    pub text: String,
    /// Event ID being replied to.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Event ID being edited. Edits are sent synchronously.
    #[serde(default)]
    pub edit_of: Option<String>,
    /// Explicit mentions selected in the composer.
    #[serde(default)]
    pub mentions: Option<Mentions>,
    /// Link previews to embed in the message.
    #[serde(default)]
    pub link_previews: Vec<Value>,
}

/// Requests accepted by the backend runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum BackendCommand {
    /// Compose and send a message from composer text.
    SendMessage(SendMessageParams),
    /// Send an arbitrary room event.
    SendEvent {
        /// Target room ID.
        room_id: String,
        /// Event type, for example `m.reaction`.
        event_type: String,
        /// Event content.
        content: Value,
        /// Bypass the per-room send queue and wait for the server.
        #[serde(default)]
        synchronous: bool,
    },
    /// Send a state event. Always synchronous and never echoed locally.
    SetState {
        /// Target room ID.
        room_id: String,
        /// State event type.
        event_type: String,
        /// State key.
        state_key: String,
        /// Event content.
        content: Value,
    },
    /// Retry a failed send.
    Resend {
        /// Transaction ID of the failed local echo.
        transaction_id: String,
    },
    /// Send a read receipt for the newest eligible timeline event.
    MarkRead {
        /// Target room ID.
        room_id: String,
    },
    /// Fetch older history for a room.
    Paginate {
        /// Target room ID.
        room_id: String,
        /// Maximum number of events to fetch.
        limit: u16,
    },
    /// Look up one event by ID, fetching it if it is not loaded.
    GetEvent {
        /// Room the event belongs to.
        room_id: String,
        /// Event ID to look up.
        event_id: String,
    },
    /// Fetch the full current state of a room.
    GetRoomState {
        /// Target room ID.
        room_id: String,
        /// Include the member list (can be large).
        #[serde(default)]
        include_members: bool,
    },
    /// Shrink a room's in-memory cache after it was closed.
    CollectGarbage {
        /// Target room ID.
        room_id: String,
    },
    /// Cancel an in-flight request.
    Cancel {
        /// Request being cancelled.
        request_id: RequestId,
        /// Optional reason forwarded into the cancellation error.
        #[serde(default)]
        reason: Option<String>,
    },
    /// Keepalive carrying the last pushed frame the client applied.
    Ping {
        /// Frame ID of the last applied push, `0` for none.
        last_received_id: i64,
    },
}

impl BackendCommand {
    /// Stable name used in logs and on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => "send_message",
            Self::SendEvent { .. } => "send_event",
            Self::SetState { .. } => "set_state",
            Self::Resend { .. } => "resend",
            Self::MarkRead { .. } => "mark_read",
            Self::Paginate { .. } => "paginate",
            Self::GetEvent { .. } => "get_event",
            Self::GetRoomState { .. } => "get_room_state",
            Self::CollectGarbage { .. } => "collect_garbage",
            Self::Cancel { .. } => "cancel",
            Self::Ping { .. } => "ping",
        }
    }
}

/// Request paired with the ID its response will carry.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Request correlation ID.
    pub request_id: RequestId,
    /// The request itself.
    pub command: BackendCommand,
}

/// Acknowledgement emitted once per finished send attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Room the event was sent to.
    pub room_id: String,
    /// Transaction ID of the local echo.
    pub transaction_id: String,
    /// Server event ID on success.
    pub event_id: Option<String>,
    /// Human-readable send error on failure.
    pub error: Option<String>,
}

/// Event channel output emitted by the backend runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BackendEvent {
    /// Successful response to a request.
    Response {
        /// Correlation ID of the request.
        request_id: RequestId,
        /// Response payload.
        data: Value,
    },
    /// Failed response to a request.
    Error {
        /// Correlation ID of the request.
        request_id: RequestId,
        /// Failure details.
        error: BackendError,
    },
    /// Connection lifecycle transition.
    ConnectionStateChanged {
        /// New connection state.
        state: ConnectionState,
    },
    /// Send acknowledgement.
    SendAck(SendAck),
    /// Reply to [`BackendCommand::Ping`].
    Pong {
        /// Echo of the ping's last received ID.
        last_received_id: i64,
        /// Identifier of the current backend run.
        run_id: String,
        /// Frames pushed after `last_received_id`, oldest first. `None`
        /// when they are no longer buffered and the client must reset.
        replay: Option<Vec<Frame>>,
    },
    /// Fatal runtime error.
    FatalError {
        /// Stable backend error code.
        code: String,
        /// Human-readable error message.
        message: String,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn commands_use_command_and_data_envelope() {
        let cmd = BackendCommand::MarkRead {
            room_id: "!r:example.org".into(),
        };
        let value = serde_json::to_value(&cmd).expect("command should serialize");
        assert_eq!(
            value,
            json!({ "command": "mark_read", "data": { "room_id": "!r:example.org" } })
        );
        assert_eq!(cmd.name(), "mark_read");
    }

    #[test]
    fn payload_routing_metadata() {
        let payload = SyncPayload::Typing(Typing {
            room_id: "!r:example.org".into(),
            user_ids: vec!["@bob:example.org".into()],
        });
        assert_eq!(payload.kind(), "typing");
        assert_eq!(payload.room_id(), Some("!r:example.org"));

        let payload = SyncPayload::Connection(ConnectionEvent::InitComplete);
        assert_eq!(payload.room_id(), None);
    }

    #[test]
    fn send_event_defaults_to_queued() {
        let cmd: BackendCommand = serde_json::from_value(json!({
            "command": "send_event",
            "data": { "room_id": "!r", "event_type": "m.reaction", "content": {} }
        }))
        .expect("command should deserialize");
        assert!(matches!(
            cmd,
            BackendCommand::SendEvent {
                synchronous: false,
                ..
            }
        ));
    }
}
