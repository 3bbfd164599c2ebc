use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hicli_core::{BackendChannels, BackendError, BackendEvent, PushLog, RequestId};
use serde_json::Value;
use tracing::warn;

/// Emits backend events to subscribers and records pushes for resume.
#[derive(Clone)]
pub struct EventEmitter {
    channels: BackendChannels,
    log: Arc<Mutex<PushLog>>,
}

impl EventEmitter {
    pub fn new(channels: BackendChannels, log: PushLog) -> Self {
        Self {
            channels,
            log: Arc::new(Mutex::new(log)),
        }
    }

    fn log(&self) -> MutexGuard<'_, PushLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run_id(&self) -> String {
        self.log().run_id().to_owned()
    }

    /// Emit an unsolicited event. The log lock is held while emitting so
    /// frame IDs reach subscribers in order.
    pub fn push(&self, event: BackendEvent) {
        let mut log = self.log();
        if let Err(err) = log.record(&event) {
            warn!(error = %err, "failed to record pushed event");
        }
        self.channels.emit(event);
    }

    pub fn respond(&self, request_id: RequestId, result: Result<Value, BackendError>) {
        let event = match result {
            Ok(data) => BackendEvent::Response { request_id, data },
            Err(error) => BackendEvent::Error { request_id, error },
        };
        self.channels.emit(event);
    }

    /// Answer a ping with the pushes the client missed, if still buffered.
    pub fn pong(&self, last_received_id: RequestId) {
        let log = self.log();
        let replay = log.replay_since(last_received_id);
        if replay.is_none() {
            warn!(last_received_id, "pushes since last ack are gone, client must reset");
        }
        self.channels.emit(BackendEvent::Pong {
            last_received_id,
            run_id: log.run_id().to_owned(),
            replay,
        });
    }
}
