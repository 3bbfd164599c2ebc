//! Drives the runtime against a scripted transport and logs what the stores
//! end up with.

mod logging;

use std::{collections::HashMap, process::ExitCode, sync::Arc, time::Duration};

use hicli_core::{
    BackendCommand, BackendEvent, ConnectionEvent, EventStream, SendAck, SendMessageParams,
    SyncPayload,
    model::{
        Event, EventRowId, NameQuality, Room, SyncComplete, SyncRoom, TimelineRowId,
        TimelineRowTuple, event_type,
    },
};
use hicli_platform::InMemoryEventStore;
use hicli_runtime::{
    RuntimeConfig, RuntimeHandle, ScriptedTransport, TransportError, spawn_runtime,
};
use serde_json::json;
use tokio::time::timeout;
use tracing::{error, info, warn};

const GENERAL: &str = "!general:hicli.local";
const SECRET: &str = "!secret:hicli.local";
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

fn room(room_id: &str, name: &str, encrypted: bool) -> Room {
    Room {
        name: Some(name.to_owned()),
        name_quality: NameQuality::Explicit,
        encryption_event: encrypted.then(|| json!({ "algorithm": "m.megolm.v1.aes-sha2" })),
        ..Room::new(room_id)
    }
}

fn greeting(room_id: &str, rowid: i64) -> Event {
    Event {
        rowid: EventRowId(rowid),
        timeline_rowid: TimelineRowId(rowid),
        room_id: room_id.to_owned(),
        id: format!("$welcome-{rowid}"),
        sender: "@bot:hicli.local".to_owned(),
        event_type: event_type::MESSAGE.to_owned(),
        timestamp: rowid * 1_000,
        content: json!({ "msgtype": "m.text", "body": "welcome" }),
        ..Event::default()
    }
}

fn initial_sync() -> SyncPayload {
    let mut rooms = HashMap::new();
    for (rowid, meta) in [
        (1, room(GENERAL, "General", false)),
        (2, room(SECRET, "Secret", true)),
    ] {
        let event = greeting(&meta.room_id, rowid);
        rooms.insert(
            meta.room_id.clone(),
            SyncRoom {
                timeline: vec![TimelineRowTuple {
                    timeline_rowid: event.timeline_rowid,
                    event_rowid: event.rowid,
                }],
                events: vec![event],
                meta: Some(meta),
                ..SyncRoom::default()
            },
        );
    }
    SyncPayload::SyncComplete(SyncComplete {
        rooms,
        ..SyncComplete::default()
    })
}

async fn next_ack(events: &mut EventStream) -> Option<SendAck> {
    loop {
        match timeout(ACK_TIMEOUT, events.recv()).await {
            Ok(Ok(BackendEvent::SendAck(ack))) => return Some(ack),
            Ok(Ok(BackendEvent::Error { request_id, error })) => {
                warn!(request_id, code = %error.code, message = %error.message, "request failed");
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                warn!(error = %err, "event stream interrupted");
                return None;
            }
            Err(_) => return None,
        }
    }
}

async fn send_text(handle: &RuntimeHandle, events: &mut EventStream, room_id: &str, text: &str) -> bool {
    let params = SendMessageParams {
        room_id: room_id.to_owned(),
        text: text.to_owned(),
        ..SendMessageParams::default()
    };
    if let Err(err) = handle.request(BackendCommand::SendMessage(params)).await {
        error!(error = %err, "runtime is not accepting requests");
        return false;
    }
    match next_ack(events).await {
        Some(ack) => {
            info!(
                room_id = %ack.room_id,
                transaction_id = %ack.transaction_id,
                event_id = ack.event_id.as_deref(),
                error = ack.error.as_deref(),
                "send acknowledged"
            );
            ack.error.is_none()
        }
        None => {
            error!(room_id, "no send acknowledgement");
            false
        }
    }
}

fn log_room_list(handle: &RuntimeHandle) {
    for entry in handle.store().room_list().iter() {
        let preview = entry
            .preview_event
            .as_ref()
            .and_then(|event| event.get_content().get("body"))
            .and_then(|body| body.as_str())
            .unwrap_or_default();
        info!(
            room_id = %entry.room_id,
            name = %entry.name,
            sorting_timestamp = entry.sorting_timestamp,
            preview,
            "room list entry"
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(2);
        }
    };
    let gc = config.gc.clone();

    let transport = Arc::new(ScriptedTransport::new());
    let handle = spawn_runtime(config, Arc::new(InMemoryEventStore::new()), transport.clone());
    let mut events = handle.subscribe();
    let _room_list = handle
        .store()
        .subscribe_room_list(|list| info!(rooms = list.len(), "room list updated"));

    for payload in [
        SyncPayload::Connection(ConnectionEvent::Connecting),
        SyncPayload::Connection(ConnectionEvent::Connected {
            run_id: handle.run_id().to_owned(),
        }),
        initial_sync(),
        SyncPayload::Connection(ConnectionEvent::InitComplete),
    ] {
        if let Err(err) = handle.push_payload(payload).await {
            error!(error = %err, "pipeline is not accepting payloads");
            return ExitCode::FAILURE;
        }
    }

    let mut ok = send_text(&handle, &mut events, GENERAL, "hello from **hicli**").await;

    transport.fail_next_encrypt(TransportError::session("outbound session expired"));
    ok &= send_text(&handle, &mut events, SECRET, "/me checks the encrypted path").await;
    info!(shares = transport.session_shares(), "group sessions shared");

    log_room_list(&handle);
    if let Some(stats) = handle.store().collect_garbage(GENERAL, &gc) {
        info!(
            events_discarded = stats.events_discarded,
            state_discarded = stats.state_discarded,
            target = stats.target,
            "collected garbage"
        );
    }

    handle.shutdown().await;
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
