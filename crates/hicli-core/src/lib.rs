//! Core contract shared by the hicli stores, runtime, and frontend bridge.
//!
//! This crate defines the event/room data model, the request/push protocol,
//! change notification primitives, and common error/channel abstractions.

/// Async request/event channel primitives.
pub mod channel;
/// Synchronous listener registries used by the stores.
pub mod dispatcher;
/// Stable backend error types.
pub mod error;
/// Events, rooms, and the payloads that carry them.
pub mod model;
/// Send acknowledgement normalization.
pub mod normalization;
/// Wire frames and the push replay log.
pub mod protocol;
/// Backoff policy used by retry loops.
pub mod retry;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Frontend-facing protocol types (requests, pushes, events).
pub mod types;

use std::time::{SystemTime, UNIX_EPOCH};

pub use channel::{BackendChannelError, BackendChannels, EventStream};
pub use dispatcher::{EventDispatcher, MultiNotifier, Subscription};
pub use error::{BackendError, BackendErrorCategory};
pub use normalization::{SendOutcome, normalize_fatal_error, normalize_send_outcome};
pub use protocol::{Frame, ProtocolError, PushLog};
pub use retry::RetryPolicy;
pub use state_machine::ConnectionStateMachine;
pub use types::{
    BackendCommand, BackendEvent, ConnectionEvent, ConnectionState, Mentions, RequestEnvelope,
    RequestId, SendAck, SendMessageParams, SyncPayload,
};

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}
