use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{
    event::{Event, EventRowId, TimelineRowId},
    room::{AccountData, InvitedRoom, Room, SpaceEdge},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelineRowTuple {
    pub timeline_rowid: TimelineRowId,
    pub event_rowid: EventRowId,
}

/// Per-room slice of one sync batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRoom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Room>,
    /// Rows appended to the timeline, oldest first.
    #[serde(default)]
    pub timeline: Vec<TimelineRowTuple>,
    /// `event_type -> state_key -> event rowid`.
    #[serde(default)]
    pub state: HashMap<String, HashMap<String, EventRowId>>,
    #[serde(default)]
    pub account_data: HashMap<String, AccountData>,
    /// Every event referenced by this batch, applied in order.
    #[serde(default)]
    pub events: Vec<Event>,
    /// The server replaced the timeline instead of appending to it.
    #[serde(default)]
    pub reset: bool,
}

/// One processed sync batch as pushed by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncComplete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    /// Drop all cached rooms before applying this batch.
    #[serde(default)]
    pub clear_state: bool,
    #[serde(default)]
    pub account_data: HashMap<String, AccountData>,
    #[serde(default)]
    pub rooms: HashMap<String, SyncRoom>,
    #[serde(default)]
    pub left_rooms: Vec<String>,
    #[serde(default)]
    pub invited_rooms: Vec<InvitedRoom>,
    /// Replacement child lists keyed by space room ID.
    #[serde(default)]
    pub space_edges: HashMap<String, Vec<SpaceEdge>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_level_spaces: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventsDecrypted {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_event_rowid: Option<EventRowId>,
    pub events: Vec<Event>,
}

/// Events fetched one by one, for example a reply target outside the loaded
/// timeline. Applied to the room without becoming timeline rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventsFetched {
    pub room_id: String,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendComplete {
    pub event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    pub room_id: String,
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaginationResult {
    pub room_id: String,
    /// Page of history, newest first.
    pub events: Vec<Event>,
    /// Edits and other events the page refers to but that are not timeline rows.
    #[serde(default)]
    pub related_events: Vec<Event>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomStateKind {
    /// Individual state events, merged into the current state.
    Single,
    /// Complete state replacing the cached map.
    Full { omit_members: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomStateResult {
    pub room_id: String,
    pub kind: RoomStateKind,
    pub events: Vec<Event>,
}
