use crate::{
    error::BackendError,
    model::SendComplete,
    types::{BackendEvent, SendAck},
};

/// Send attempt result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Server accepted the event.
    Success { event_id: String },
    /// Send failed with a human-readable error.
    Failure { error: String },
}

impl SendOutcome {
    /// Derive the outcome from a send-complete payload.
    ///
    /// An event still carrying its `~` placeholder ID never reached the
    /// server, whatever the payload's error field says.
    pub fn from_send_complete(complete: &SendComplete) -> Self {
        let event = &complete.event;
        match (&complete.error, &event.send_error) {
            (Some(error), _) | (None, Some(error)) if !error.is_empty() => Self::Failure {
                error: error.clone(),
            },
            _ if event.is_local_echo() => Self::Failure {
                error: "event was not sent".to_owned(),
            },
            _ => Self::Success {
                event_id: event.id.clone(),
            },
        }
    }
}

/// Convert a send outcome to a stable `BackendEvent::SendAck`.
pub fn normalize_send_outcome(
    room_id: impl Into<String>,
    transaction_id: impl Into<String>,
    outcome: SendOutcome,
) -> BackendEvent {
    let room_id = room_id.into();
    let transaction_id = transaction_id.into();
    match outcome {
        SendOutcome::Success { event_id } => BackendEvent::SendAck(SendAck {
            room_id,
            transaction_id,
            event_id: Some(event_id),
            error: None,
        }),
        SendOutcome::Failure { error } => BackendEvent::SendAck(SendAck {
            room_id,
            transaction_id,
            event_id: None,
            error: Some(error),
        }),
    }
}

/// Convert an error into a `FatalError` backend event.
pub fn normalize_fatal_error(error: BackendError, recoverable: bool) -> BackendEvent {
    BackendEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}
