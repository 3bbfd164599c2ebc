//! Homeserver boundary used by the send path and request handlers.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use hicli_core::{
    BackendError, BackendErrorCategory,
    model::{Event, PaginationResult, TimelineRowId},
};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The outbound group session is missing, expired, or not shared yet.
    Session,
    Network,
    Forbidden,
    Other,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Session, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn is_session_error(&self) -> bool {
        self.kind == TransportErrorKind::Session
    }
}

impl From<TransportError> for BackendError {
    fn from(err: TransportError) -> Self {
        let (category, code) = match err.kind {
            TransportErrorKind::Session => (BackendErrorCategory::Crypto, "crypto_session_error"),
            TransportErrorKind::Network => (BackendErrorCategory::Network, "network_error"),
            TransportErrorKind::Forbidden => (BackendErrorCategory::Auth, "forbidden"),
            TransportErrorKind::Other => (BackendErrorCategory::Internal, "transport_error"),
        };
        BackendError::new(category, code, err.message)
    }
}

/// Network and crypto operations the runtime needs from a homeserver client.
#[async_trait]
pub trait MatrixTransport: Send + Sync {
    /// Send a room event and return the server-assigned event ID.
    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
        transaction_id: &str,
    ) -> Result<String, TransportError>;

    /// Encrypt a plaintext payload with the room's outbound group session.
    async fn encrypt_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<Value, TransportError>;

    async fn share_group_session(&self, room_id: &str) -> Result<(), TransportError>;

    async fn set_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String, TransportError>;

    async fn mark_read(&self, room_id: &str, event_id: &str) -> Result<(), TransportError>;

    /// Fetch history older than `before`, newest first.
    async fn paginate(
        &self,
        room_id: &str,
        before: Option<TimelineRowId>,
        limit: u16,
    ) -> Result<PaginationResult, TransportError>;

    async fn fetch_room_state(
        &self,
        room_id: &str,
        include_members: bool,
    ) -> Result<Vec<Event>, TransportError>;

    /// Fetch a single event that is not in the local store.
    async fn fetch_event(&self, room_id: &str, event_id: &str) -> Result<Event, TransportError>;
}

/// One event accepted by [`ScriptedTransport::send_event`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentEvent {
    pub room_id: String,
    pub event_type: String,
    pub content: Value,
    pub transaction_id: String,
}

#[derive(Debug, Default)]
struct Script {
    send_failures: VecDeque<TransportError>,
    encrypt_failures: VecDeque<TransportError>,
    pages: HashMap<String, VecDeque<PaginationResult>>,
    room_state: HashMap<String, Vec<Event>>,
    remote_events: HashMap<(String, String), Event>,
    event_fetches: usize,
    sent: Vec<SentEvent>,
    receipts: Vec<(String, String)>,
    session_shares: usize,
    next_event: u64,
}

/// In-process transport that replays queued responses. Used by the smoke
/// binary and by tests.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_next_send(&self, err: TransportError) {
        self.script().send_failures.push_back(err);
    }

    pub fn fail_next_encrypt(&self, err: TransportError) {
        self.script().encrypt_failures.push_back(err);
    }

    pub fn push_page(&self, room_id: &str, page: PaginationResult) {
        self.script()
            .pages
            .entry(room_id.to_owned())
            .or_default()
            .push_back(page);
    }

    pub fn set_room_state(&self, room_id: &str, events: Vec<Event>) {
        self.script().room_state.insert(room_id.to_owned(), events);
    }

    pub fn add_remote_event(&self, event: Event) {
        self.script()
            .remote_events
            .insert((event.room_id.clone(), event.id.clone()), event);
    }

    pub fn event_fetches(&self) -> usize {
        self.script().event_fetches
    }

    pub fn sent(&self) -> Vec<SentEvent> {
        self.script().sent.clone()
    }

    pub fn receipts(&self) -> Vec<(String, String)> {
        self.script().receipts.clone()
    }

    pub fn session_shares(&self) -> usize {
        self.script().session_shares
    }
}

#[async_trait]
impl MatrixTransport for ScriptedTransport {
    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
        transaction_id: &str,
    ) -> Result<String, TransportError> {
        let mut script = self.script();
        if let Some(err) = script.send_failures.pop_front() {
            return Err(err);
        }
        script.next_event += 1;
        script.sent.push(SentEvent {
            room_id: room_id.to_owned(),
            event_type: event_type.to_owned(),
            content: content.clone(),
            transaction_id: transaction_id.to_owned(),
        });
        Ok(format!("$scripted-{}", script.next_event))
    }

    async fn encrypt_event(
        &self,
        _room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<Value, TransportError> {
        if let Some(err) = self.script().encrypt_failures.pop_front() {
            return Err(err);
        }
        let plaintext = json!({ "type": event_type, "content": content }).to_string();
        Ok(json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "ciphertext": plaintext,
        }))
    }

    async fn share_group_session(&self, _room_id: &str) -> Result<(), TransportError> {
        self.script().session_shares += 1;
        Ok(())
    }

    async fn set_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String, TransportError> {
        let state_key = state_key.to_owned();
        self.send_event(room_id, event_type, content, &state_key)
            .await
    }

    async fn mark_read(&self, room_id: &str, event_id: &str) -> Result<(), TransportError> {
        self.script()
            .receipts
            .push((room_id.to_owned(), event_id.to_owned()));
        Ok(())
    }

    async fn paginate(
        &self,
        room_id: &str,
        _before: Option<TimelineRowId>,
        _limit: u16,
    ) -> Result<PaginationResult, TransportError> {
        Ok(self
            .script()
            .pages
            .get_mut(room_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| PaginationResult {
                room_id: room_id.to_owned(),
                events: Vec::new(),
                related_events: Vec::new(),
                has_more: false,
            }))
    }

    async fn fetch_room_state(
        &self,
        room_id: &str,
        _include_members: bool,
    ) -> Result<Vec<Event>, TransportError> {
        Ok(self
            .script()
            .room_state
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_event(&self, room_id: &str, event_id: &str) -> Result<Event, TransportError> {
        let mut script = self.script();
        script.event_fetches += 1;
        script
            .remote_events
            .get(&(room_id.to_owned(), event_id.to_owned()))
            .cloned()
            .ok_or_else(|| {
                TransportError::new(TransportErrorKind::Other, format!("M_NOT_FOUND: {event_id}"))
            })
    }
}
