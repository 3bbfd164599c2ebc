//! Outgoing events: local echo, per-room send queue, lazy encryption, resend.
//!
//! Every send is persisted and shown as a pending local echo before any
//! network call. The network attempt runs on its own task and always ends in
//! exactly one [`SyncPayload::SendComplete`] pushed into the pipeline, even
//! when the request that started it was cancelled.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicI64, Ordering},
    },
};

use hicli_core::{
    BackendError, RetryPolicy, SendMessageParams, SyncPayload, now_ms,
    model::{
        Event, EventRowId, NOT_SENT_ERROR, SYNTHETIC_EVENT_PREFIX, SendComplete, event_type,
    },
};
use hicli_platform::{EventStore, StoreError, with_busy_retry};
use hicli_store::{GlobalStore, MarkReadParams, RoomStore};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    compose::{Composed, compose},
    config::RuntimeConfig,
    transport::{MatrixTransport, TransportError},
};

/// One network attempt for a stored local echo.
#[derive(Debug, Clone)]
struct SendJob {
    event: Event,
    /// Type and content before encryption.
    plaintext_type: String,
    plaintext: Value,
    encrypted: bool,
}

impl SendJob {
    fn from_stored(event: Event) -> Self {
        let encrypted = event.event_type == event_type::ENCRYPTED && event.decrypted.is_some();
        let plaintext_type = event.get_type().to_owned();
        let plaintext = event.original_content().clone();
        Self {
            event,
            plaintext_type,
            plaintext,
            encrypted,
        }
    }

    fn transaction_id(&self) -> &str {
        self.event.transaction_id.as_deref().unwrap_or_default()
    }
}

struct Delivered {
    event_id: String,
    ciphertext: Option<Value>,
}

/// Send error prefix recorded when the server accepted an event whose new ID
/// could not be stored. Followed by the server-assigned ID.
const ACCEPTED_PREFIX: &str = "accepted as ";

/// Server-assigned ID of a row that is still stored as a local echo.
fn accepted_event_id(event: &Event) -> Option<&str> {
    event
        .send_error
        .as_deref()?
        .strip_prefix(ACCEPTED_PREFIX)?
        .split_whitespace()
        .next()
}

pub(crate) fn storage_error(err: StoreError) -> BackendError {
    BackendError::storage(err.to_string())
}

pub struct SendPath {
    client_id: String,
    user_id: String,
    store: Arc<dyn EventStore>,
    global: Arc<GlobalStore>,
    transport: Arc<dyn MatrixTransport>,
    payload_tx: mpsc::Sender<SyncPayload>,
    room_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    busy_policy: RetryPolicy,
    next_notice_rowid: AtomicI64,
}

impl SendPath {
    pub fn new(
        config: &RuntimeConfig,
        store: Arc<dyn EventStore>,
        global: Arc<GlobalStore>,
        transport: Arc<dyn MatrixTransport>,
        payload_tx: mpsc::Sender<SyncPayload>,
    ) -> Self {
        Self {
            client_id: config.client_id.clone(),
            user_id: config.user_id.clone(),
            store,
            global,
            transport,
            payload_tx,
            room_locks: Mutex::new(HashMap::new()),
            busy_policy: RetryPolicy::storage_busy(),
            next_notice_rowid: AtomicI64::new(-1),
        }
    }

    fn room(&self, room_id: &str) -> Result<Arc<RoomStore>, BackendError> {
        self.global
            .room(room_id)
            .ok_or_else(|| BackendError::room_not_found(room_id))
    }

    fn room_lock(&self, room_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .room_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(room_id.to_owned()).or_default())
    }

    async fn lookup_event(&self, room: &RoomStore, event_id: &str) -> Result<Event, BackendError> {
        if let Some(event) = room.event_by_id(event_id) {
            return Ok(Event::clone(&event));
        }
        with_busy_retry(&self.busy_policy, "get_event_by_id", || {
            self.store.get_event_by_id(event_id)
        })
        .await
        .map_err(storage_error)?
        .ok_or_else(|| BackendError::event_not_found(event_id))
    }

    /// Compose and send composer text, or show a local notice for it.
    pub async fn send_message(
        self: &Arc<Self>,
        params: SendMessageParams,
    ) -> Result<Event, BackendError> {
        let room = self.room(&params.room_id)?;
        let reply_to = match &params.reply_to {
            Some(event_id) => Some(self.lookup_event(&room, event_id).await?),
            None => None,
        };
        let edit_of = match &params.edit_of {
            Some(event_id) => Some(self.lookup_event(&room, event_id).await?),
            None => None,
        };

        match compose(&params, &self.user_id, reply_to.as_ref(), edit_of.as_ref())? {
            Composed::Notice(text) => Ok(self.local_notice(&room, text)),
            Composed::Send {
                event_type,
                content,
                synchronous,
            } => {
                self.send_event(&params.room_id, &event_type, content, synchronous)
                    .await
            }
        }
    }

    fn local_notice(&self, room: &RoomStore, text: String) -> Event {
        let rowid = EventRowId(self.next_notice_rowid.fetch_sub(1, Ordering::Relaxed));
        let event = Event {
            rowid,
            room_id: room.room_id().to_owned(),
            id: format!("{SYNTHETIC_EVENT_PREFIX}{}", Uuid::new_v4()),
            sender: self.user_id.clone(),
            event_type: event_type::MESSAGE.to_owned(),
            timestamp: now_ms(),
            content: json!({ "msgtype": "m.notice", "body": text }),
            ..Event::default()
        };
        room.apply_pending(event.clone());
        event
    }

    /// Persist a local echo and dispatch it.
    ///
    /// Queued sends return as soon as the echo is stored. Synchronous sends
    /// wait for the server and fail with `send_failed` if it rejected them.
    pub async fn send_event(
        self: &Arc<Self>,
        room_id: &str,
        event_type: &str,
        content: Value,
        synchronous: bool,
    ) -> Result<Event, BackendError> {
        let room = self.room(room_id)?;
        let encrypted = room.meta().is_encrypted();
        let transaction_id = format!("{}-{}", self.client_id, Uuid::new_v4());

        let mut draft = Event {
            room_id: room_id.to_owned(),
            id: format!("~{transaction_id}"),
            sender: self.user_id.clone(),
            event_type: event_type.to_owned(),
            timestamp: now_ms(),
            content: content.clone(),
            transaction_id: Some(transaction_id),
            send_error: Some(NOT_SENT_ERROR.to_owned()),
            pending: true,
            ..Event::default()
        };
        if encrypted {
            draft.event_type = event_type::ENCRYPTED.to_owned();
            draft.content = json!({});
            draft.decrypted = Some(content.clone());
            draft.decrypted_type = Some(event_type.to_owned());
        }
        draft.parse_relation();

        let mut event = with_busy_retry(&self.busy_policy, "insert_event", || {
            self.store.insert_event(draft.clone())
        })
        .await
        .map_err(storage_error)?;
        event.pending = true;
        room.apply_pending(event.clone());
        debug!(
            room_id,
            rowid = event.rowid.0,
            transaction_id = event.transaction_id.as_deref(),
            encrypted,
            synchronous,
            "stored local echo"
        );

        let job = SendJob {
            event: event.clone(),
            plaintext_type: event_type.to_owned(),
            plaintext: content,
            encrypted,
        };
        let this = Arc::clone(self);
        let attempt = tokio::spawn(async move { this.dispatch(job, synchronous).await });
        if !synchronous {
            return Ok(event);
        }

        let sent = attempt
            .await
            .map_err(|err| BackendError::internal(format!("send task failed: {err}")))?;
        match sent.send_error {
            Some(error) => Err(BackendError::send_failed(error)),
            None => Ok(sent),
        }
    }

    /// Retry a failed local echo under its original transaction ID.
    pub async fn resend(self: &Arc<Self>, transaction_id: &str) -> Result<Event, BackendError> {
        let mut event = with_busy_retry(&self.busy_policy, "get_event_by_transaction_id", || {
            self.store.get_event_by_transaction_id(transaction_id)
        })
        .await
        .map_err(storage_error)?
        .ok_or_else(|| BackendError::event_not_found(transaction_id))?;
        if !event.is_local_echo() {
            return Err(BackendError::already_sent(&event.id));
        }
        let room = self.room(&event.room_id)?;
        let confirmed = room
            .event_by_rowid(event.rowid)
            .filter(|echo| !echo.is_local_echo())
            .map(|echo| echo.id.clone());
        if let Some(event_id) = accepted_event_id(&event).map(ToOwned::to_owned).or(confirmed) {
            return Err(BackendError::already_sent(&event_id));
        }

        with_busy_retry(&self.busy_policy, "update_send_error", || {
            self.store.update_send_error(event.rowid, None)
        })
        .await
        .map_err(storage_error)?;
        event.send_error = None;
        event.pending = true;
        room.apply_resend(event.clone());
        info!(
            room_id = %event.room_id,
            transaction_id,
            "resending event"
        );

        let job = SendJob::from_stored(event.clone());
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch(job, false).await });
        Ok(event)
    }

    async fn dispatch(&self, job: SendJob, synchronous: bool) -> Event {
        let room_lock = (!synchronous).then(|| self.room_lock(&job.event.room_id));
        let _queued = match &room_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let result = self.attempt(&job).await;
        self.finish(job.event, result).await
    }

    async fn attempt(&self, job: &SendJob) -> Result<Delivered, TransportError> {
        let room_id = &job.event.room_id;
        if !job.encrypted {
            let event_id = self
                .transport
                .send_event(
                    room_id,
                    &job.plaintext_type,
                    &job.plaintext,
                    job.transaction_id(),
                )
                .await?;
            return Ok(Delivered {
                event_id,
                ciphertext: None,
            });
        }

        match self.encrypt_and_send(job).await {
            Err(err) if err.is_session_error() => {
                warn!(room_id = %room_id, error = %err, "group session unusable, sharing a new one");
                self.transport.share_group_session(room_id).await?;
                self.encrypt_and_send(job).await
            }
            result => result,
        }
    }

    async fn encrypt_and_send(&self, job: &SendJob) -> Result<Delivered, TransportError> {
        let room_id = &job.event.room_id;
        let ciphertext = self
            .transport
            .encrypt_event(room_id, &job.plaintext_type, &job.plaintext)
            .await?;
        if let Err(err) = with_busy_retry(&self.busy_policy, "update_encrypted_content", || {
            self.store
                .update_encrypted_content(job.event.rowid, &ciphertext)
        })
        .await
        {
            warn!(room_id = %room_id, rowid = job.event.rowid.0, error = %err, "failed to store ciphertext");
        }
        let event_id = self
            .transport
            .send_event(
                room_id,
                event_type::ENCRYPTED,
                &ciphertext,
                job.transaction_id(),
            )
            .await?;
        Ok(Delivered {
            event_id,
            ciphertext: Some(ciphertext),
        })
    }

    async fn finish(&self, mut event: Event, result: Result<Delivered, TransportError>) -> Event {
        match result {
            Ok(delivered) => {
                if let Some(ciphertext) = delivered.ciphertext {
                    event.content = ciphertext;
                }
                let stored = with_busy_retry(&self.busy_policy, "update_event_id", || {
                    self.store.update_event_id(event.rowid, &delivered.event_id)
                })
                .await;
                event.id = delivered.event_id;
                event.send_error = match stored {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(room_id = %event.room_id, event_id = %event.id, error = %err, "failed to store sent event ID");
                        let message =
                            format!("{ACCEPTED_PREFIX}{} but failed to store event ID: {err}", event.id);
                        // Resend reads the accepted ID back from this.
                        if let Err(store_err) =
                            with_busy_retry(&self.busy_policy, "update_send_error", || {
                                self.store.update_send_error(event.rowid, Some(&message))
                            })
                            .await
                        {
                            warn!(room_id = %event.room_id, error = %store_err, "failed to store send error");
                        }
                        Some(message)
                    }
                };
            }
            Err(err) => {
                let message = if err.message.is_empty() {
                    "failed to send event".to_owned()
                } else {
                    err.message
                };
                if let Err(store_err) = with_busy_retry(&self.busy_policy, "update_send_error", || {
                    self.store.update_send_error(event.rowid, Some(&message))
                })
                .await
                {
                    warn!(room_id = %event.room_id, error = %store_err, "failed to store send error");
                }
                warn!(
                    room_id = %event.room_id,
                    transaction_id = event.transaction_id.as_deref(),
                    error = %message,
                    "send failed"
                );
                event.send_error = Some(message);
            }
        }
        event.pending = false;

        let complete = SendComplete {
            error: event.send_error.clone(),
            event: event.clone(),
        };
        if self
            .payload_tx
            .send(SyncPayload::SendComplete(complete))
            .await
            .is_err()
        {
            warn!(room_id = %event.room_id, "pipeline stopped, dropping send completion");
        }
        event
    }

    /// Send a state event. Never echoed locally.
    pub async fn set_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String, BackendError> {
        self.room(room_id)?;
        Ok(self
            .transport
            .set_state(room_id, event_type, state_key, content)
            .await?)
    }

    /// Send a read receipt for the newest eligible event, if there is one.
    pub async fn mark_read(&self, room_id: &str) -> Result<Option<MarkReadParams>, BackendError> {
        let room = self.room(room_id)?;
        let Some(params) = room.mark_as_read_params() else {
            return Ok(None);
        };
        self.transport.mark_read(room_id, &params.event_id).await?;
        Ok(Some(params))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hicli_core::model::{Room, SyncComplete, SyncRoom, TimelineRowId, TimelineRowTuple};
    use hicli_platform::InMemoryEventStore;
    use tokio::time::timeout;

    use super::*;
    use crate::transport::ScriptedTransport;

    const ROOM: &str = "!send:example.org";

    struct Harness {
        send: Arc<SendPath>,
        store: InMemoryEventStore,
        transport: Arc<ScriptedTransport>,
        global: Arc<GlobalStore>,
        payload_rx: mpsc::Receiver<SyncPayload>,
    }

    fn harness(encrypted: bool) -> Harness {
        let store = InMemoryEventStore::new();
        let transport = Arc::new(ScriptedTransport::new());
        let global = Arc::new(GlobalStore::new());
        let mut meta = Room::new(ROOM);
        if encrypted {
            meta.encryption_event = Some(json!({ "algorithm": "m.megolm.v1.aes-sha2" }));
        }
        global.apply_sync(SyncComplete {
            rooms: HashMap::from([(
                ROOM.to_owned(),
                SyncRoom {
                    meta: Some(meta),
                    ..SyncRoom::default()
                },
            )]),
            ..SyncComplete::default()
        });
        let (payload_tx, payload_rx) = mpsc::channel(16);
        let send = Arc::new(SendPath::new(
            &RuntimeConfig::default(),
            Arc::new(store.clone()),
            Arc::clone(&global),
            transport.clone(),
            payload_tx,
        ));
        Harness {
            send,
            store,
            transport,
            global,
            payload_rx,
        }
    }

    async fn next_completion(rx: &mut mpsc::Receiver<SyncPayload>) -> SendComplete {
        let payload = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("completion timeout")
            .expect("payload channel open");
        match payload {
            SyncPayload::SendComplete(complete) => complete,
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    fn text(body: &str) -> SendMessageParams {
        SendMessageParams {
            room_id: ROOM.into(),
            text: body.into(),
            ..SendMessageParams::default()
        }
    }

    #[tokio::test]
    async fn queued_send_shows_local_echo_then_completes() {
        let mut h = harness(false);
        let echo = h.send.send_message(text("hello")).await.expect("send should start");

        assert!(echo.is_local_echo());
        assert_eq!(echo.send_error.as_deref(), Some(NOT_SENT_ERROR));
        let txn = echo.transaction_id.clone().expect("transaction id");
        assert!(txn.starts_with("hicli-"));
        assert_eq!(echo.id, format!("~{txn}"));
        let room = h.global.room(ROOM).expect("room exists");
        assert!(room.timeline().iter().any(|event| event.rowid == echo.rowid && event.pending));

        let complete = next_completion(&mut h.payload_rx).await;
        assert_eq!(complete.event.rowid, echo.rowid);
        assert_eq!(complete.event.id, "$scripted-1");
        assert_eq!(complete.error, None);
        let stored = h
            .store
            .get_event_by_rowid(echo.rowid)
            .expect("store read")
            .expect("row exists");
        assert_eq!(stored.id, "$scripted-1");
    }

    #[tokio::test]
    async fn encrypted_send_failure_then_resend() {
        let mut h = harness(true);
        h.transport.fail_next_encrypt(TransportError::session("no outbound session"));
        h.transport.fail_next_encrypt(TransportError::session("still no session"));

        let echo = h.send.send_message(text("hello")).await.expect("send should start");
        assert_eq!(echo.event_type, event_type::ENCRYPTED);
        assert_eq!(echo.get_type(), event_type::MESSAGE);
        assert_eq!(echo.send_error.as_deref(), Some(NOT_SENT_ERROR));

        let failed = next_completion(&mut h.payload_rx).await;
        assert_eq!(h.transport.session_shares(), 1);
        assert_eq!(failed.error.as_deref(), Some("still no session"));
        assert!(failed.event.is_local_echo());
        assert_eq!(failed.event.id, echo.id);

        let txn = echo.transaction_id.clone().expect("transaction id");
        let retried = h.send.resend(&txn).await.expect("resend should start");
        assert_eq!(retried.send_error, None);
        assert_eq!(retried.transaction_id.as_deref(), Some(txn.as_str()));
        assert_eq!(retried.rowid, echo.rowid);

        let sent = next_completion(&mut h.payload_rx).await;
        assert_eq!(sent.error, None);
        assert!(!sent.event.is_local_echo());
        let wire = h.transport.sent();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].event_type, event_type::ENCRYPTED);
        assert_eq!(wire[0].transaction_id, txn);
    }

    #[tokio::test]
    async fn session_share_retry_recovers_the_first_attempt() {
        let mut h = harness(true);
        h.transport.fail_next_encrypt(TransportError::session("expired"));

        h.send.send_message(text("hi")).await.expect("send should start");
        let complete = next_completion(&mut h.payload_rx).await;
        assert_eq!(complete.error, None);
        assert_eq!(h.transport.session_shares(), 1);
        assert!(complete.event.content.get("ciphertext").is_some());
    }

    #[tokio::test]
    async fn network_errors_are_not_retried() {
        let mut h = harness(false);
        h.transport.fail_next_send(TransportError::network("offline"));

        h.send.send_message(text("hi")).await.expect("send should start");
        let complete = next_completion(&mut h.payload_rx).await;
        assert_eq!(complete.error.as_deref(), Some("offline"));
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.transport.session_shares(), 0);
    }

    #[tokio::test]
    async fn resend_rejects_accepted_and_unknown_events() {
        let mut h = harness(false);
        let echo = h.send.send_message(text("hello")).await.expect("send should start");
        next_completion(&mut h.payload_rx).await;

        let txn = echo.transaction_id.expect("transaction id");
        let err = h.send.resend(&txn).await.expect_err("already accepted");
        assert_eq!(err.code, "already_sent");

        let err = h.send.resend("hicli-missing").await.expect_err("unknown txn");
        assert_eq!(err.code, "event_not_found");
    }

    #[tokio::test]
    async fn resend_refuses_event_the_server_accepted() {
        let mut h = harness(false);
        let echo = h.send.send_message(text("hello")).await.expect("send should start");
        // Busy for every attempt to record the server-assigned ID.
        h.store.inject_busy(6);

        let complete = next_completion(&mut h.payload_rx).await;
        assert_eq!(complete.event.id, "$scripted-1");
        let error = complete.error.expect("ID was not stored");
        assert!(error.starts_with("accepted as $scripted-1 "), "{error}");
        let stored = h
            .store
            .get_event_by_rowid(echo.rowid)
            .expect("store read")
            .expect("row exists");
        assert!(stored.is_local_echo());

        let txn = echo.transaction_id.expect("transaction id");
        let err = h.send.resend(&txn).await.expect_err("server already has it");
        assert_eq!(err.code, "already_sent");
        assert!(err.message.contains("$scripted-1"), "{}", err.message);
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn synchronous_send_reports_failure_to_caller() {
        let mut h = harness(false);
        h.transport.fail_next_send(TransportError::network("timeout"));

        let err = h
            .send
            .send_event(ROOM, "m.room.message", json!({ "body": "x" }), true)
            .await
            .expect_err("synchronous send waits for the server");
        assert_eq!(err.code, "send_failed");
        let complete = next_completion(&mut h.payload_rx).await;
        assert_eq!(complete.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn insert_failure_surfaces_as_storage_error() {
        let h = harness(false);
        h.store.inject_busy(100);
        let err = h
            .send
            .send_message(text("hello"))
            .await
            .expect_err("store stays busy");
        assert_eq!(err.code, "storage_error");
        assert!(h.global.room(ROOM).expect("room").timeline().is_empty());
    }

    #[tokio::test]
    async fn unknown_command_shows_notice_without_sending() {
        let h = harness(false);
        let notice = h
            .send
            .send_message(text("/bogus stuff"))
            .await
            .expect("notice should be shown");
        assert!(notice.is_synthetic());
        assert!(notice.rowid.0 < 0);
        let room = h.global.room(ROOM).expect("room");
        assert_eq!(room.timeline().len(), 1);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn missing_room_and_edit_target_are_errors() {
        let h = harness(false);
        let mut params = text("hi");
        params.room_id = "!nope:example.org".into();
        let err = h.send.send_message(params).await.expect_err("unknown room");
        assert_eq!(err.code, "room_not_found");

        let mut params = text("fixed");
        params.edit_of = Some("$missing".into());
        let err = h.send.send_message(params).await.expect_err("unknown target");
        assert_eq!(err.code, "event_not_found");

        let err = h
            .send
            .set_state("!nope:example.org", "m.room.topic", "", &json!({}))
            .await
            .expect_err("unknown room");
        assert_eq!(err.code, "room_not_found");
    }

    #[tokio::test]
    async fn mark_read_sends_receipt_for_newest_event() {
        let h = harness(false);
        let mut event = Event {
            rowid: EventRowId(5),
            timeline_rowid: TimelineRowId(5),
            room_id: ROOM.into(),
            id: "$five".into(),
            sender: "@bob:example.org".into(),
            event_type: event_type::MESSAGE.into(),
            timestamp: 5,
            content: json!({ "msgtype": "m.text", "body": "hey" }),
            ..Event::default()
        };
        event.parse_relation();
        h.global.room(ROOM).expect("room").apply_sync(SyncRoom {
            timeline: vec![TimelineRowTuple {
                timeline_rowid: event.timeline_rowid,
                event_rowid: event.rowid,
            }],
            events: vec![event],
            ..SyncRoom::default()
        });

        let params = h.send.mark_read(ROOM).await.expect("receipt sent");
        assert_eq!(params.map(|p| p.event_id).as_deref(), Some("$five"));
        assert_eq!(h.transport.receipts(), vec![(ROOM.to_owned(), "$five".to_owned())]);
        assert_eq!(h.send.mark_read(ROOM).await.expect("nothing new"), None);
    }
}
