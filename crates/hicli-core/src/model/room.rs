use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::{EventRowId, event_type};

/// How trustworthy a room name is. Higher wins.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NameQuality {
    #[default]
    Nil,
    Participants,
    CanonicalAlias,
    Explicit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyLoadSummary {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub heroes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_member_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invited_member_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predecessor {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Subset of `m.room.create` content the client acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationContent {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<Predecessor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    #[serde(default)]
    pub body: String,
    pub replacement_room: String,
}

/// Room metadata as maintained by local storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_content: Option<CreationContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<Tombstone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub name_quality: NameQuality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub explicit_avatar: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lazy_load_summary: Option<LazyLoadSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_event: Option<Value>,
    #[serde(default)]
    pub has_member_list: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_event_rowid: Option<EventRowId>,
    #[serde(default)]
    pub sorting_timestamp: i64,
    #[serde(default)]
    pub unread_highlights: u64,
    #[serde(default)]
    pub unread_notifications: u64,
    #[serde(default)]
    pub unread_messages: u64,
    #[serde(default)]
    pub marked_unread: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

impl Room {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ..Self::default()
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption_event.is_some()
    }

    /// Rooms with a creation type (spaces and similar) are not conversations.
    pub fn is_conversational(&self) -> bool {
        self.creation_content
            .as_ref()
            .and_then(|content| content.room_type.as_deref())
            .is_none_or(str::is_empty)
    }

    pub fn predecessor(&self) -> Option<&str> {
        self.creation_content
            .as_ref()?
            .predecessor
            .as_ref()
            .map(|predecessor| predecessor.room_id.as_str())
            .filter(|room_id| !room_id.is_empty())
    }

    pub fn replacement_room(&self) -> Option<&str> {
        self.tombstone
            .as_ref()
            .map(|tombstone| tombstone.replacement_room.as_str())
            .filter(|room_id| !room_id.is_empty())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.room_id)
    }

    /// Merge an incoming snapshot into this one and report whether anything
    /// changed.
    ///
    /// A name of lower quality than the current one is ignored, as is a
    /// derived avatar while an explicit one is set. The sorting timestamp is
    /// clamped to `now_ms` so clock skew cannot pin a room to the top.
    pub fn merge(&mut self, mut incoming: Room, now_ms: i64) -> bool {
        if incoming.name_quality < self.name_quality {
            incoming.name = self.name.clone();
            incoming.name_quality = self.name_quality;
        }
        if self.explicit_avatar && !incoming.explicit_avatar {
            incoming.avatar = self.avatar.clone();
            incoming.explicit_avatar = true;
        }
        incoming.sorting_timestamp = incoming.sorting_timestamp.min(now_ms);
        if incoming.room_id.is_empty() {
            incoming.room_id = self.room_id.clone();
        }

        if incoming == *self {
            return false;
        }
        *self = incoming;
        true
    }

    /// Move the sorting timestamp forward, never past `now_ms`.
    pub fn bump_sorting_timestamp(&mut self, timestamp_ms: i64, now_ms: i64) -> bool {
        let candidate = timestamp_ms.min(now_ms);
        if candidate > self.sorting_timestamp {
            self.sorting_timestamp = candidate;
            true
        } else {
            false
        }
    }
}

/// A global or per-room account data entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountData {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default)]
    pub content: Value,
}

/// Stripped state event shipped with an invite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrippedStateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub state_key: String,
    pub sender: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvitedRoom {
    pub room_id: String,
    /// Milliseconds; used as the invite's room-list sorting timestamp.
    pub created_at: i64,
    #[serde(default)]
    pub invite_state: Vec<StrippedStateEvent>,
}

impl InvitedRoom {
    fn state_content(&self, event_type: &str, field: &str) -> Option<&str> {
        self.invite_state
            .iter()
            .find(|evt| evt.event_type == event_type && evt.state_key.is_empty())
            .and_then(|evt| evt.content.get(field))
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.state_content(event_type::NAME, "name")
            .or_else(|| self.state_content(event_type::CANONICAL_ALIAS, "alias"))
    }

    pub fn avatar(&self) -> Option<&str> {
        self.state_content("m.room.avatar", "url")
    }

    /// Sender of the invite membership event.
    pub fn inviter(&self) -> Option<&str> {
        self.invite_state
            .iter()
            .find(|evt| {
                evt.event_type == event_type::MEMBER
                    && evt.content.get("membership").and_then(Value::as_str) == Some("invite")
            })
            .map(|evt| evt.sender.as_str())
    }

    /// Direct-message invites carry `is_direct` on the membership event.
    pub fn dm_user_id(&self) -> Option<&str> {
        self.invite_state
            .iter()
            .find(|evt| {
                evt.event_type == event_type::MEMBER
                    && evt.content.get("is_direct").and_then(Value::as_bool) == Some(true)
            })
            .map(|evt| evt.sender.as_str())
    }
}

/// Child entry of a space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceEdge {
    pub child_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(default)]
    pub suggested: bool,
}
