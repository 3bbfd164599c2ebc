use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendErrorCategory {
    /// Invalid input or a request referring to unknown rooms/events.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by homeserver.
    RateLimited,
    /// Cryptographic/encryption failure.
    Crypto,
    /// Local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// The request was cancelled before it finished.
    Cancelled,
    /// Internal backend bug or invariant break.
    Internal,
}

/// Stable backend error payload emitted across the request/response boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct BackendError {
    /// High-level error category.
    pub category: BackendErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl BackendError {
    /// Construct a new backend error.
    pub fn new(
        category: BackendErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            BackendErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot apply '{action}' while connection is {current:?}"),
        )
    }

    pub fn room_not_found(room_id: &str) -> Self {
        Self::new(
            BackendErrorCategory::Config,
            "room_not_found",
            format!("room {room_id} is not known"),
        )
    }

    pub fn event_not_found(event_ref: &str) -> Self {
        Self::new(
            BackendErrorCategory::Config,
            "event_not_found",
            format!("event {event_ref} is not known"),
        )
    }

    /// Resend was requested for an event the server already accepted.
    pub fn already_sent(event_id: &str) -> Self {
        Self::new(
            BackendErrorCategory::Config,
            "already_sent",
            format!("event {event_id} was already sent"),
        )
    }

    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Config, "invalid_command", message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Storage, "storage_error", message)
    }

    pub fn send_failed(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Network, "send_failed", message)
    }

    pub fn cancelled(reason: Option<&str>) -> Self {
        Self::new(
            BackendErrorCategory::Cancelled,
            "cancelled",
            reason.unwrap_or("request cancelled"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Internal, "internal", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = BackendError::invalid_state(ConnectionState::Disconnected, "init_complete");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, BackendErrorCategory::Internal);
        assert!(err.message.contains("init_complete"));
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = BackendError::new(BackendErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn lookup_failures_are_config_errors() {
        let room = BackendError::room_not_found("!missing:example.org");
        assert_eq!(room.code, "room_not_found");
        assert_eq!(room.category, BackendErrorCategory::Config);

        let sent = BackendError::already_sent("$abc");
        assert_eq!(sent.code, "already_sent");
    }

    #[test]
    fn cancellation_uses_reason_when_given() {
        assert_eq!(
            BackendError::cancelled(Some("user closed room")).message,
            "user closed room"
        );
        assert_eq!(BackendError::cancelled(None).code, "cancelled");
    }
}
