//! JSON frame codec for the frontend bridge and the replay log of pushed frames.
//!
//! Every message on the wire is a [`Frame`]. Requests carry positive request
//! IDs chosen by the client. Responses reuse them. Unsolicited pushes get
//! negative IDs counting down from `-1`, so a reconnecting client can name the
//! last push it applied and receive only what it missed.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{BackendCommand, BackendEvent, RequestEnvelope, RequestId};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request frames need a positive request_id, got {0}")]
    InvalidRequestId(RequestId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub command: String,
    pub request_id: RequestId,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Wrap a request for the wire.
    pub fn from_request(envelope: &RequestEnvelope) -> Result<Self, ProtocolError> {
        let data = match serde_json::to_value(&envelope.command)? {
            Value::Object(mut map) => map.remove("data").unwrap_or(Value::Null),
            other => other,
        };
        Ok(Self {
            command: envelope.command.name().to_owned(),
            request_id: envelope.request_id,
            data,
        })
    }

    /// Parse a request frame received from a client.
    pub fn into_request(self) -> Result<RequestEnvelope, ProtocolError> {
        if self.request_id <= 0 {
            return Err(ProtocolError::InvalidRequestId(self.request_id));
        }
        let command: BackendCommand = serde_json::from_value(serde_json::json!({
            "command": self.command,
            "data": self.data,
        }))?;
        Ok(RequestEnvelope {
            request_id: self.request_id,
            command,
        })
    }

    /// Wrap an outgoing event. Responses keep their request ID, pushes use `push_id`.
    pub fn from_event(event: &BackendEvent, push_id: RequestId) -> Result<Self, ProtocolError> {
        let request_id = match event {
            BackendEvent::Response { request_id, .. } | BackendEvent::Error { request_id, .. } => {
                *request_id
            }
            _ => push_id,
        };
        let mut data = serde_json::to_value(event)?;
        let command = match data.as_object_mut().and_then(|map| map.remove("event")) {
            Some(Value::String(name)) => name,
            _ => "event".to_owned(),
        };
        Ok(Self {
            command,
            request_id,
            data,
        })
    }
}

/// Bounded log of pushed frames for resuming after a reconnect.
#[derive(Debug)]
pub struct PushLog {
    run_id: String,
    capacity: usize,
    next_id: RequestId,
    frames: VecDeque<Frame>,
}

impl PushLog {
    pub fn new(run_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            run_id: run_id.into(),
            capacity: capacity.max(1),
            next_id: -1,
            frames: VecDeque::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// ID of the newest recorded push, `0` before the first one.
    pub fn newest_id(&self) -> RequestId {
        self.next_id + 1
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Assign the next push ID to `event`, store the frame, and return it.
    pub fn record(&mut self, event: &BackendEvent) -> Result<Frame, ProtocolError> {
        let frame = Frame::from_event(event, self.next_id)?;
        self.next_id -= 1;
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame.clone());
        Ok(frame)
    }

    /// Frames pushed after `last_received_id`, oldest first.
    ///
    /// Returns `None` when the client is ahead of this run or when frames it
    /// missed were already evicted. The client must then reset its state.
    pub fn replay_since(&self, last_received_id: RequestId) -> Option<Vec<Frame>> {
        if last_received_id > 0 || last_received_id < self.newest_id() {
            return None;
        }
        if last_received_id == self.newest_id() {
            return Some(Vec::new());
        }
        let oldest = self.frames.front()?;
        if oldest.request_id < last_received_id - 1 {
            return None;
        }
        Some(
            self.frames
                .iter()
                .filter(|frame| frame.request_id < last_received_id)
                .cloned()
                .collect(),
        )
    }
}
