use std::sync::Arc;

use hicli_core::model::{Event, InvitedRoom, Room};
use serde::Serialize;

/// Denormalized projection of a room for the room list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomListEntry {
    pub room_id: String,
    pub dm_user_id: Option<String>,
    pub name: String,
    pub avatar: Option<String>,
    pub sorting_timestamp: i64,
    pub preview_event: Option<Arc<Event>>,
    pub unread_messages: u64,
    pub unread_notifications: u64,
    pub unread_highlights: u64,
    pub marked_unread: bool,
    pub is_invite: bool,
}

/// Room list as published to subscribers, most recent first.
pub type RoomList = Arc<[RoomListEntry]>;

impl RoomListEntry {
    pub fn from_room(room: &Room, preview_event: Option<Arc<Event>>) -> Self {
        Self {
            room_id: room.room_id.clone(),
            dm_user_id: room.dm_user_id.clone(),
            name: room.display_name().to_owned(),
            avatar: room.avatar.clone(),
            sorting_timestamp: room.sorting_timestamp,
            preview_event,
            unread_messages: room.unread_messages,
            unread_notifications: room.unread_notifications,
            unread_highlights: room.unread_highlights,
            marked_unread: room.marked_unread,
            is_invite: false,
        }
    }

    pub fn from_invite(invite: &InvitedRoom) -> Self {
        Self {
            room_id: invite.room_id.clone(),
            dm_user_id: invite.dm_user_id().map(ToOwned::to_owned),
            name: invite.name().unwrap_or(&invite.room_id).to_owned(),
            avatar: invite.avatar().map(ToOwned::to_owned),
            sorting_timestamp: invite.created_at,
            preview_event: None,
            unread_messages: 0,
            unread_notifications: 0,
            unread_highlights: 1,
            marked_unread: false,
            is_invite: true,
        }
    }

    fn sort_key(&self) -> (i64, &str) {
        (self.sorting_timestamp, &self.room_id)
    }
}

/// Ascending order by sorting timestamp, room ID as tiebreak.
pub(crate) fn sort_entries(entries: &mut [RoomListEntry]) {
    entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

pub(crate) fn insert_sorted(entries: &mut Vec<RoomListEntry>, entry: RoomListEntry) {
    let index = entries.partition_point(|existing| existing.sort_key() < entry.sort_key());
    entries.insert(index, entry);
}

pub(crate) fn remove_entry(entries: &mut Vec<RoomListEntry>, room_id: &str) {
    if let Some(index) = entries.iter().position(|entry| entry.room_id == room_id) {
        entries.remove(index);
    }
}

/// Most-recent-first view of an ascending list.
pub(crate) fn reversed(entries: &[RoomListEntry]) -> RoomList {
    entries.iter().rev().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(room_id: &str, ts: i64) -> RoomListEntry {
        let mut room = Room::new(room_id);
        room.sorting_timestamp = ts;
        RoomListEntry::from_room(&room, None)
    }

    #[test]
    fn binary_insert_keeps_ascending_order() {
        let mut entries = vec![entry("!a", 10), entry("!b", 30)];
        insert_sorted(&mut entries, entry("!c", 20));
        insert_sorted(&mut entries, entry("!d", 40));
        insert_sorted(&mut entries, entry("!e", 5));
        let ids: Vec<_> = entries.iter().map(|e| e.room_id.as_str()).collect();
        assert_eq!(ids, vec!["!e", "!a", "!c", "!b", "!d"]);

        let newest_first = reversed(&entries);
        assert_eq!(newest_first[0].room_id, "!d");
    }

    #[test]
    fn equal_timestamps_break_ties_by_room_id() {
        let mut entries = vec![entry("!z", 1), entry("!a", 1)];
        sort_entries(&mut entries);
        assert_eq!(entries[0].room_id, "!a");

        insert_sorted(&mut entries, entry("!m", 1));
        assert_eq!(entries[1].room_id, "!m");

        remove_entry(&mut entries, "!m");
        assert_eq!(entries.len(), 2);
    }
}
