use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{BackendCommand, BackendEvent, RequestEnvelope, RequestId};

/// Broadcast event stream type used by frontend subscribers.
pub type EventStream = broadcast::Receiver<BackendEvent>;

/// Errors returned by backend channel operations.
#[derive(Debug, Error)]
pub enum BackendChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
    /// The sync payload pipeline has stopped.
    #[error("payload channel is closed")]
    PayloadChannelClosed,
}

/// Request/event channel pair used by the runtime and frontend bridge layers.
#[derive(Clone, Debug)]
pub struct BackendChannels {
    command_tx: mpsc::Sender<RequestEnvelope>,
    event_tx: broadcast::Sender<BackendEvent>,
}

impl BackendChannels {
    /// Create a new channel set and return it with the request receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<RequestEnvelope>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Clone the event sender.
    pub fn event_sender(&self) -> broadcast::Sender<BackendEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to emitted backend events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Send one request to the runtime.
    pub async fn send_command(
        &self,
        request_id: RequestId,
        command: BackendCommand,
    ) -> Result<(), BackendChannelError> {
        self.command_tx
            .send(RequestEnvelope {
                request_id,
                command,
            })
            .await
            .map_err(|_| BackendChannelError::CommandChannelClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: BackendEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionState;

    #[tokio::test]
    async fn sends_requests_to_receiver() {
        let (channels, mut rx) = BackendChannels::new(8, 8);
        channels
            .send_command(
                3,
                BackendCommand::MarkRead {
                    room_id: "!r:example.org".into(),
                },
            )
            .await
            .expect("command send should work");

        let envelope = rx.recv().await.expect("receiver should have a command");
        assert_eq!(envelope.request_id, 3);
        match envelope.command {
            BackendCommand::MarkRead { room_id } => assert_eq!(room_id, "!r:example.org"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _) = BackendChannels::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        channels.emit(BackendEvent::ConnectionStateChanged {
            state: ConnectionState::Connecting,
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[tokio::test]
    async fn reports_closed_runtime() {
        let (channels, rx) = BackendChannels::new(1, 1);
        drop(rx);
        let err = channels
            .send_command(1, BackendCommand::Ping { last_received_id: 0 })
            .await
            .expect_err("closed receiver should fail");
        assert!(matches!(err, BackendChannelError::CommandChannelClosed));
    }
}
