use crate::{
    error::BackendError,
    types::{BackendEvent, ConnectionEvent, ConnectionState},
};

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply a pushed connection event and return the resulting state change,
    /// or `None` when the state did not change.
    pub fn apply(&mut self, event: &ConnectionEvent) -> Result<Option<BackendEvent>, BackendError> {
        use ConnectionState::*;

        match event {
            ConnectionEvent::Connecting => self.transition_from_any_of(
                &[Disconnected, Reconnecting, Connecting, Connected, Syncing],
                Connecting,
                "connecting",
            ),
            ConnectionEvent::Connected { .. } => {
                self.transition_from_any_of(&[Connecting, Reconnecting], Connected, "connected")
            }
            ConnectionEvent::InitComplete => {
                self.transition_from_any_of(&[Connected, Reconnecting], Syncing, "init_complete")
            }
            ConnectionEvent::SyncError { .. } => self.transition_from_any_of(
                &[Connected, Syncing, Reconnecting],
                Reconnecting,
                "sync_error",
            ),
            ConnectionEvent::Disconnected { recoverable, .. } => {
                let next = if *recoverable { Disconnected } else { Fatal };
                Ok(self.set(next))
            }
        }
    }

    fn set(&mut self, next: ConnectionState) -> Option<BackendEvent> {
        if self.state == next {
            return None;
        }
        self.state = next;
        Some(BackendEvent::ConnectionStateChanged { state: next })
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ConnectionState],
        next: ConnectionState,
        action: &str,
    ) -> Result<Option<BackendEvent>, BackendError> {
        if !expected.contains(&self.state) {
            return Err(BackendError::invalid_state(self.state, action));
        }
        Ok(self.set(next))
    }
}
