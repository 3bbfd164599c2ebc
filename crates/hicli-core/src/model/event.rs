use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known Matrix event types the stores care about.
pub mod event_type {
    pub const MESSAGE: &str = "m.room.message";
    pub const STICKER: &str = "m.sticker";
    pub const ENCRYPTED: &str = "m.room.encrypted";
    pub const REDACTION: &str = "m.room.redaction";
    pub const REACTION: &str = "m.reaction";
    pub const MEMBER: &str = "m.room.member";
    pub const POWER_LEVELS: &str = "m.room.power_levels";
    pub const CREATE: &str = "m.room.create";
    pub const TOMBSTONE: &str = "m.room.tombstone";
    pub const NAME: &str = "m.room.name";
    pub const CANONICAL_ALIAS: &str = "m.room.canonical_alias";
    pub const BOT_COMMANDS: &str = "org.matrix.msc4332.commands";
    pub const EMOTE_PACK: &str = "im.ponies.room_emotes";
}

/// Offset added to the local timestamp of unsent events so they always sort
/// after every server-assigned timeline row.
pub const PENDING_TIMELINE_OFFSET: i64 = 1_000_000_000_000;

/// Event ID prefix of client-only notices that never reach the server.
pub const SYNTHETIC_EVENT_PREFIX: &str = "~local-notice-";

/// Send error placed on a freshly created local echo.
pub const NOT_SENT_ERROR: &str = "not sent";

/// Local storage row ID. Primary key and ordering tiebreak within one installation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventRowId(pub i64);

/// Position of an event in a room timeline. Independent from [`EventRowId`]
/// because pagination inserts old events after newer ones were stored.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimelineRowId(pub i64);

impl TimelineRowId {
    /// Sentinel position for an unsent event created at `timestamp_ms`.
    pub fn pending(timestamp_ms: i64) -> Self {
        Self(PENDING_TIMELINE_OFFSET.saturating_add(timestamp_ms.max(0)))
    }

    /// Whether this is a sentinel position rather than a server-assigned row.
    pub fn is_pending_sentinel(self) -> bool {
        self.0 >= PENDING_TIMELINE_OFFSET
    }

    /// Whether local storage placed this event in the confirmed timeline.
    /// Rows prepended by pagination may be negative.
    pub fn is_assigned(self) -> bool {
        self.0 != 0 && !self.is_pending_sentinel()
    }
}

/// Relation kinds understood by the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationType {
    #[serde(rename = "m.replace")]
    Replace,
    #[serde(rename = "m.annotation")]
    Annotation,
    #[serde(rename = "m.in_reply_to")]
    Reply,
    #[serde(rename = "m.thread")]
    Thread,
}

impl RelationType {
    fn from_rel_type(value: &str) -> Option<Self> {
        match value {
            "m.replace" => Some(Self::Replace),
            "m.annotation" => Some(Self::Annotation),
            "m.thread" => Some(Self::Thread),
            _ => None,
        }
    }
}

/// User preferences that decide whether an event renders in the timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibilityPrefs {
    /// Effective event types the user chose to hide.
    pub hidden_event_types: BTreeSet<String>,
    /// Whether redacted events still render as placeholders.
    pub show_redacted: bool,
}

/// One room event as held in memory.
///
/// `content` is the payload as received. For encrypted events `decrypted`
/// and `decrypted_type` hold the plaintext once decryption succeeded. The
/// display content additionally follows `last_edit` when an edit superseded
/// this event, see [`Event::get_content`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub rowid: EventRowId,
    #[serde(default)]
    pub timeline_rowid: TimelineRowId,
    pub room_id: String,
    #[serde(rename = "event_id")]
    pub id: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Origin server timestamp in milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decrypted: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decrypted_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_type: Option<RelationType>,
    /// Annotation key for reactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edit_rowid: Option<EventRowId>,
    /// Resolved newest edit. Wired by the room store, never serialized.
    #[serde(skip)]
    pub last_edit: Option<Arc<Event>>,
    /// Local echo still waiting for the server to acknowledge it.
    #[serde(skip)]
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Relation {
    event_id: String,
    rel_type: RelationType,
    key: Option<String>,
}

impl Relation {
    fn from_content(content: &Value) -> Option<Self> {
        let relates_to = content.get("m.relates_to")?.as_object()?;
        let target = |value: Option<&Value>| {
            value
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(ToOwned::to_owned)
        };

        if let Some(rel_type) = relates_to.get("rel_type").and_then(Value::as_str)
            && let Some(rel_type) = RelationType::from_rel_type(rel_type)
            && let Some(event_id) = target(relates_to.get("event_id"))
        {
            let key = relates_to
                .get("key")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            return Some(Self {
                event_id,
                rel_type,
                key,
            });
        }

        let event_id = target(relates_to.get("m.in_reply_to")?.get("event_id"))?;
        Some(Self {
            event_id,
            rel_type: RelationType::Reply,
            key: None,
        })
    }
}

impl Event {
    /// Effective type: the decrypted type for a successfully decrypted
    /// envelope, otherwise the raw type.
    pub fn get_type(&self) -> &str {
        if self.event_type == event_type::ENCRYPTED && self.decrypted.is_some() {
            self.decrypted_type.as_deref().unwrap_or(&self.event_type)
        } else {
            &self.event_type
        }
    }

    /// Decrypted content if present, else raw content. Ignores edits.
    pub fn original_content(&self) -> &Value {
        self.decrypted.as_ref().unwrap_or(&self.content)
    }

    /// Display content: the newest edit's `m.new_content` when an edit is
    /// resolved, then decrypted content, then raw content.
    pub fn get_content(&self) -> &Value {
        if let Some(edit) = &self.last_edit
            && let Some(new_content) = edit.original_content().get("m.new_content")
            && new_content.is_object()
        {
            return new_content;
        }
        self.original_content()
    }

    /// Populate relation fields from the effective payload.
    ///
    /// State events never carry relations. Malformed `m.relates_to` yields
    /// no relation instead of an error.
    pub fn parse_relation(&mut self) {
        let relation = if self.state_key.is_some() {
            None
        } else {
            Relation::from_content(self.original_content())
        };

        match relation {
            Some(relation) => {
                self.relates_to = Some(relation.event_id);
                self.relation_type = Some(relation.rel_type);
                self.reaction_key = relation.key;
            }
            None => {
                self.relates_to = None;
                self.relation_type = None;
                self.reaction_key = None;
            }
        }
    }

    /// Event ID targeted by a redaction, if this is one.
    pub fn redacts(&self) -> Option<&str> {
        if self.get_type() != event_type::REDACTION {
            return None;
        }
        self.original_content()
            .get("redacts")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Whether the event ID is still a local placeholder (`~<transaction-id>`).
    pub fn is_local_echo(&self) -> bool {
        self.id.starts_with('~')
    }

    /// Whether this is a client-only notice that never reaches the server.
    pub fn is_synthetic(&self) -> bool {
        self.id.starts_with(SYNTHETIC_EVENT_PREFIX)
    }

    pub fn is_edit(&self) -> bool {
        self.relation_type == Some(RelationType::Replace)
    }

    fn is_message_like(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            event_type::MESSAGE | event_type::STICKER
        ) || (self.event_type == event_type::ENCRYPTED
            && matches!(
                self.decrypted_type.as_deref(),
                Some(event_type::MESSAGE | event_type::STICKER)
            ))
    }

    /// Whether the event can be shown as a room's latest-message preview.
    pub fn can_use_for_preview(&self) -> bool {
        self.is_message_like() && !self.is_edit() && self.redacted_by.is_none()
    }

    /// Whether the event moves the room up in the room list.
    pub fn bumps_sorting_timestamp(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            event_type::MESSAGE | event_type::STICKER | event_type::ENCRYPTED
        ) && !self.is_edit()
    }

    /// Whether the event renders as its own timeline row.
    pub fn is_visible(&self, prefs: &VisibilityPrefs) -> bool {
        let effective = self.get_type();
        if matches!(effective, event_type::REACTION | event_type::REDACTION) {
            return false;
        }
        if matches!(
            self.relation_type,
            Some(RelationType::Replace | RelationType::Annotation)
        ) {
            return false;
        }
        if self.redacted_by.is_some() && !prefs.show_redacted {
            return false;
        }
        !prefs.hidden_event_types.contains(effective)
    }

    /// Strip the event down to what survives a redaction.
    pub fn redact(&mut self, redacted_by: &str) {
        let kept_membership = (self.event_type == event_type::MEMBER)
            .then(|| self.content.get("membership").cloned())
            .flatten();
        let mut content = serde_json::Map::new();
        if let Some(membership) = kept_membership {
            content.insert("membership".to_owned(), membership);
        }

        self.redacted_by = Some(redacted_by.to_owned());
        self.content = Value::Object(content);
        self.decrypted = None;
        self.decrypted_type = None;
        self.relates_to = None;
        self.relation_type = None;
        self.reaction_key = None;
        self.last_edit = None;
        self.last_edit_rowid = None;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(rowid: i64, body: &str) -> Event {
        Event {
            rowid: EventRowId(rowid),
            room_id: "!room:example.org".to_owned(),
            id: format!("$evt{rowid}"),
            sender: "@alice:example.org".to_owned(),
            event_type: event_type::MESSAGE.to_owned(),
            timestamp: 1_700_000_000_000 + rowid,
            content: json!({ "msgtype": "m.text", "body": body }),
            ..Event::default()
        }
    }

    #[test]
    fn effective_type_follows_successful_decryption() {
        let mut evt = message(1, "");
        evt.event_type = event_type::ENCRYPTED.to_owned();
        evt.decrypted_type = Some(event_type::MESSAGE.to_owned());
        assert_eq!(evt.get_type(), event_type::ENCRYPTED);

        evt.decrypted = Some(json!({ "body": "secret" }));
        assert_eq!(evt.get_type(), event_type::MESSAGE);
    }

    #[test]
    fn content_prefers_edit_then_decrypted_then_raw() {
        let mut original = message(10, "raw");
        assert_eq!(original.get_content()["body"], "raw");

        original.decrypted = Some(json!({ "body": "plain" }));
        assert_eq!(original.get_content()["body"], "plain");

        let mut edit = message(11, "* fixed");
        edit.content = json!({
            "body": "* fixed",
            "m.new_content": { "msgtype": "m.text", "body": "fixed" },
            "m.relates_to": { "rel_type": "m.replace", "event_id": "$evt10" },
        });
        original.last_edit = Some(Arc::new(edit));
        assert_eq!(original.get_content()["body"], "fixed");
        assert_eq!(original.original_content()["body"], "plain");
    }

    #[test]
    fn parses_replace_annotation_and_reply_relations() {
        let mut edit = message(2, "* x");
        edit.content["m.relates_to"] = json!({ "rel_type": "m.replace", "event_id": "$evt1" });
        edit.parse_relation();
        assert_eq!(edit.relation_type, Some(RelationType::Replace));
        assert_eq!(edit.relates_to.as_deref(), Some("$evt1"));
        assert!(edit.is_edit());

        let mut reaction = message(3, "");
        reaction.event_type = event_type::REACTION.to_owned();
        reaction.content = json!({
            "m.relates_to": { "rel_type": "m.annotation", "event_id": "$evt1", "key": "👍" }
        });
        reaction.parse_relation();
        assert_eq!(reaction.relation_type, Some(RelationType::Annotation));
        assert_eq!(reaction.reaction_key.as_deref(), Some("👍"));

        let mut reply = message(4, "yes");
        reply.content["m.relates_to"] = json!({ "m.in_reply_to": { "event_id": "$evt1" } });
        reply.parse_relation();
        assert_eq!(reply.relation_type, Some(RelationType::Reply));
    }

    #[test]
    fn malformed_relation_degrades_to_none() {
        let mut evt = message(5, "hi");
        evt.content["m.relates_to"] = json!("not an object");
        evt.parse_relation();
        assert_eq!(evt.relation_type, None);

        evt.content["m.relates_to"] = json!({ "rel_type": "m.replace", "event_id": 42 });
        evt.parse_relation();
        assert_eq!(evt.relates_to, None);
    }

    #[test]
    fn state_events_never_carry_relations() {
        let mut evt = message(6, "");
        evt.state_key = Some(String::new());
        evt.content["m.relates_to"] = json!({ "rel_type": "m.replace", "event_id": "$evt1" });
        evt.parse_relation();
        assert_eq!(evt.relation_type, None);
    }

    #[test]
    fn encrypted_relation_is_read_from_decrypted_payload() {
        let mut evt = message(7, "");
        evt.event_type = event_type::ENCRYPTED.to_owned();
        evt.content = json!({ "algorithm": "m.megolm.v1.aes-sha2", "ciphertext": "..." });
        evt.decrypted = Some(json!({
            "body": "* edited",
            "m.relates_to": { "rel_type": "m.replace", "event_id": "$evt1" },
        }));
        evt.decrypted_type = Some(event_type::MESSAGE.to_owned());
        evt.parse_relation();
        assert_eq!(evt.relates_to.as_deref(), Some("$evt1"));
    }

    #[test]
    fn preview_and_sorting_predicates() {
        let plain = message(8, "hello");
        assert!(plain.can_use_for_preview());
        assert!(plain.bumps_sorting_timestamp());

        let mut edit = message(9, "* hello");
        edit.relation_type = Some(RelationType::Replace);
        assert!(!edit.can_use_for_preview());
        assert!(!edit.bumps_sorting_timestamp());

        let mut undecrypted = message(10, "");
        undecrypted.event_type = event_type::ENCRYPTED.to_owned();
        assert!(!undecrypted.can_use_for_preview());
        assert!(undecrypted.bumps_sorting_timestamp());

        let mut redacted = message(11, "gone");
        redacted.redact("$redaction");
        assert!(!redacted.can_use_for_preview());
    }

    #[test]
    fn visibility_honors_hidden_types_and_redactions() {
        let mut prefs = VisibilityPrefs::default();
        let mut member = message(12, "");
        member.event_type = event_type::MEMBER.to_owned();
        assert!(member.is_visible(&prefs));

        prefs
            .hidden_event_types
            .insert(event_type::MEMBER.to_owned());
        assert!(!member.is_visible(&prefs));

        let mut redacted = message(13, "x");
        redacted.redact("$r");
        assert!(!redacted.is_visible(&prefs));
        prefs.show_redacted = true;
        assert!(redacted.is_visible(&prefs));
    }

    #[test]
    fn redaction_keeps_membership_and_drops_edits() {
        let mut member = message(14, "");
        member.event_type = event_type::MEMBER.to_owned();
        member.content = json!({ "membership": "join", "displayname": "Alice" });
        member.last_edit_rowid = Some(EventRowId(99));
        member.redact("$r");
        assert_eq!(member.content, json!({ "membership": "join" }));
        assert_eq!(member.last_edit_rowid, None);
        assert_eq!(member.redacted_by.as_deref(), Some("$r"));
    }

    #[test]
    fn pending_sentinel_sorts_after_assigned_rows() {
        let sentinel = TimelineRowId::pending(1_700_000_000_000);
        assert!(sentinel.is_pending_sentinel());
        assert!(!sentinel.is_assigned());
        assert!(TimelineRowId(5_000_000) < sentinel);
        assert!(TimelineRowId(1).is_assigned());
        assert!(TimelineRowId(-3).is_assigned());
        assert!(!TimelineRowId::default().is_assigned());
    }
}
