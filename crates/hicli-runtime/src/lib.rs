//! Backend runtime: sync payload pipeline, frontend requests, and the send path.
//!
//! [`spawn_runtime`] starts one task that owns the pipeline. Sync payloads are
//! applied there one at a time in arrival order. Frontend requests other than
//! `cancel`, `ping` and `collect_garbage` run on their own tasks so a slow
//! network call never stalls sync processing.

/// Message composition and markdown rendering.
pub mod compose;
/// Environment-backed configuration.
pub mod config;
pub mod emitter;
pub mod pipeline;
pub mod requests;
/// Outgoing event handling.
pub mod send;
/// Homeserver boundary.
pub mod transport;

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use hicli_core::{
    BackendChannelError, BackendChannels, BackendCommand, BackendError, EventStream, PushLog,
    RequestEnvelope, RequestId, SyncPayload,
};
use hicli_platform::EventStore;
use hicli_store::GlobalStore;
use serde_json::json;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use compose::{Composed, compose, render_markdown};
pub use config::{ConfigError, RuntimeConfig};
pub use emitter::EventEmitter;
pub use pipeline::Pipeline;
pub use requests::{InFlight, RequestContext};
pub use send::SendPath;
pub use transport::{MatrixTransport, ScriptedTransport, TransportError, TransportErrorKind};

/// Frontend side of a running runtime.
pub struct RuntimeHandle {
    channels: BackendChannels,
    payload_tx: mpsc::Sender<SyncPayload>,
    global: Arc<GlobalStore>,
    run_id: String,
    next_request_id: AtomicI64,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RuntimeHandle {
    /// Enqueue a request under the next free request ID and return that ID.
    pub async fn request(&self, command: BackendCommand) -> Result<RequestId, BackendChannelError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.send(request_id, command).await?;
        Ok(request_id)
    }

    /// Enqueue a request under a caller-chosen ID.
    pub async fn send(
        &self,
        request_id: RequestId,
        command: BackendCommand,
    ) -> Result<(), BackendChannelError> {
        self.channels.send_command(request_id, command).await
    }

    /// Feed one payload from the sync connection into the pipeline.
    pub async fn push_payload(&self, payload: SyncPayload) -> Result<(), BackendChannelError> {
        self.payload_tx
            .send(payload)
            .await
            .map_err(|_| BackendChannelError::PayloadChannelClosed)
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    pub fn store(&self) -> Arc<GlobalStore> {
        Arc::clone(&self.global)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stop the runtime and wait for its task to exit. In-flight requests
    /// are cancelled.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "runtime task ended abnormally");
        }
    }
}

pub fn spawn_runtime(
    config: RuntimeConfig,
    store: Arc<dyn EventStore>,
    transport: Arc<dyn MatrixTransport>,
) -> RuntimeHandle {
    let (channels, command_rx) = BackendChannels::new(config.command_buffer, config.event_buffer);
    let (payload_tx, payload_rx) = mpsc::channel(config.event_buffer.max(1));
    let run_id = Uuid::new_v4().to_string();
    let global = Arc::new(GlobalStore::new());
    let emitter = EventEmitter::new(
        channels.clone(),
        PushLog::new(run_id.clone(), config.push_log_capacity),
    );
    let send = Arc::new(SendPath::new(
        &config,
        Arc::clone(&store),
        Arc::clone(&global),
        Arc::clone(&transport),
        payload_tx.clone(),
    ));
    let requests = Arc::new(RequestContext {
        send,
        transport,
        store,
        global: Arc::clone(&global),
        payload_tx: payload_tx.clone(),
        gc: config.gc.clone(),
    });
    let shutdown = CancellationToken::new();

    let runtime = Runtime {
        pipeline: Pipeline::new(Arc::clone(&global), emitter.clone()),
        emitter,
        requests,
        in_flight: InFlight::default(),
    };
    let task = tokio::spawn(runtime.run(command_rx, payload_rx, shutdown.clone()));
    info!(run_id = %run_id, client_id = %config.client_id, "runtime started");

    RuntimeHandle {
        channels,
        payload_tx,
        global,
        run_id,
        next_request_id: AtomicI64::new(1),
        shutdown,
        task,
    }
}

struct Runtime {
    pipeline: Pipeline,
    emitter: EventEmitter,
    requests: Arc<RequestContext>,
    in_flight: InFlight,
}

impl Runtime {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<RequestEnvelope>,
        mut payload_rx: mpsc::Receiver<SyncPayload>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(payload) = payload_rx.recv() => self.pipeline.dispatch(payload),
                envelope = command_rx.recv() => match envelope {
                    Some(envelope) => self.handle(envelope),
                    None => break,
                },
            }
        }
        self.in_flight.cancel_all();
        info!("runtime stopped");
    }

    fn handle(&mut self, envelope: RequestEnvelope) {
        let RequestEnvelope {
            request_id,
            command,
        } = envelope;
        debug!(request_id, command = command.name(), "handling request");

        match command {
            BackendCommand::Cancel {
                request_id: target,
                reason,
            } => {
                let cancelled = self.in_flight.cancel(target, reason);
                debug!(request_id, target, cancelled, "cancel requested");
                self.emitter
                    .respond(request_id, Ok(json!({ "cancelled": cancelled })));
            }
            BackendCommand::Ping { last_received_id } => self.emitter.pong(last_received_id),
            BackendCommand::CollectGarbage { room_id } => {
                let result = self.requests.collect_garbage(&room_id);
                self.emitter.respond(request_id, result);
            }
            command => self.spawn_request(request_id, command),
        }
    }

    fn spawn_request(&self, request_id: RequestId, command: BackendCommand) {
        let token = self.in_flight.register(request_id);
        let in_flight = self.in_flight.clone();
        let requests = Arc::clone(&self.requests);
        let emitter = self.emitter.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                result = requests.execute(command) => Some(result),
                () = token.cancelled() => None,
            };
            let reason = in_flight.finish(request_id);
            let result = outcome.unwrap_or_else(|| {
                debug!(request_id, "request cancelled");
                Err(BackendError::cancelled(reason.as_deref()))
            });
            emitter.respond(request_id, result);
        });
    }
}
