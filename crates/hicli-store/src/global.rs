//! Client-wide state: the room map, invites, the sorted room list, and
//! global account data.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use hicli_core::{
    EventDispatcher, MultiNotifier, Subscription,
    model::{AccountData, InvitedRoom, Room, SpaceEdge, SyncComplete},
};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    gc::{GcPolicy, GcStats},
    room::{RoomChanges, RoomStore},
    room_list::{self, RoomList, RoomListEntry},
};

/// Space hierarchy as last reported by sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpaceTree {
    pub top_level_spaces: Vec<String>,
    pub edges: HashMap<String, Vec<SpaceEdge>>,
}

#[derive(Debug, Default)]
struct GlobalInner {
    rooms: HashMap<String, Arc<RoomStore>>,
    invites: HashMap<String, InvitedRoom>,
    /// Ascending by sorting timestamp; published reversed.
    room_list: Vec<RoomListEntry>,
    account_data: HashMap<String, AccountData>,
    spaces: SpaceTree,
    initial_sync_done: bool,
}

impl GlobalInner {
    /// Tombstoned rooms are hidden only once the successor is known and
    /// names this room as its predecessor.
    fn is_hidden(&self, meta: &Room) -> bool {
        if !meta.is_conversational() {
            return true;
        }
        meta.replacement_room()
            .and_then(|replacement| self.rooms.get(replacement))
            .is_some_and(|replacement| {
                replacement.meta().predecessor() == Some(meta.room_id.as_str())
            })
    }

    fn entry_for(&self, room_id: &str) -> Option<RoomListEntry> {
        if let Some(store) = self.rooms.get(room_id) {
            if self.is_hidden(&store.meta()) {
                return None;
            }
            return Some(store.list_entry());
        }
        self.invites.get(room_id).map(RoomListEntry::from_invite)
    }

    fn rebuild_list(&mut self) {
        let mut entries: Vec<RoomListEntry> = self
            .rooms
            .keys()
            .chain(self.invites.keys())
            .filter_map(|room_id| self.entry_for(room_id))
            .collect();
        room_list::sort_entries(&mut entries);
        self.room_list = entries;
    }

    fn resort(&mut self, room_id: &str) {
        room_list::remove_entry(&mut self.room_list, room_id);
        if let Some(entry) = self.entry_for(room_id) {
            room_list::insert_sorted(&mut self.room_list, entry);
        }
    }
}

pub struct GlobalStore {
    inner: RwLock<GlobalInner>,
    room_list_subs: EventDispatcher<RoomList>,
    account_data_subs: MultiNotifier<String>,
    spaces_subs: EventDispatcher<Arc<SpaceTree>>,
}

impl Default for GlobalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GlobalInner::default()),
            room_list_subs: EventDispatcher::with_value(Arc::from(Vec::new())),
            account_data_subs: MultiNotifier::new(),
            spaces_subs: EventDispatcher::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, GlobalInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GlobalInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one sync batch to every mentioned room and update the room list.
    ///
    /// Room stores are mutated while the global lock is held. All
    /// notifications fire after both locks are released.
    pub fn apply_sync(&self, sync: SyncComplete) {
        let SyncComplete {
            clear_state,
            account_data,
            rooms,
            left_rooms,
            invited_rooms,
            space_edges,
            top_level_spaces,
            ..
        } = sync;

        let mut room_changes: Vec<(Arc<RoomStore>, RoomChanges)> = Vec::with_capacity(rooms.len());
        let account_changes: Vec<String> = account_data.keys().cloned().collect();
        let spaces_changed = !space_edges.is_empty() || top_level_spaces.is_some();

        let (list, spaces) = {
            let mut inner = self.write();
            if clear_state {
                info!(rooms = inner.rooms.len(), "clearing cached room state");
                inner.rooms.clear();
                inner.invites.clear();
                inner.room_list.clear();
            }
            let full_rebuild = clear_state || !inner.initial_sync_done;
            let mut changed = BTreeSet::new();

            for invite in invited_rooms {
                changed.insert(invite.room_id.clone());
                inner.invites.insert(invite.room_id.clone(), invite);
            }

            for (room_id, room_sync) in rooms {
                let existing = inner.rooms.get(&room_id).cloned();
                let created = existing.is_none();
                let store = existing.unwrap_or_else(|| {
                    debug!(room_id = %room_id, "creating room store");
                    let store = Arc::new(RoomStore::new(room_id.clone()));
                    inner.rooms.insert(room_id.clone(), store.clone());
                    store
                });
                let was_invite = inner.invites.remove(&room_id).is_some();
                if created || was_invite || store.list_entry_changed(&room_sync) {
                    changed.insert(room_id.clone());
                }
                room_changes.push((store.clone(), store.apply_sync_deferred(room_sync)));
                if let Some(predecessor) = store.meta().predecessor() {
                    changed.insert(predecessor.to_owned());
                }
            }

            for room_id in left_rooms {
                debug!(room_id = %room_id, "discarding left room");
                inner.rooms.remove(&room_id);
                inner.invites.remove(&room_id);
                for (other_id, store) in &inner.rooms {
                    if store.meta().replacement_room() == Some(room_id.as_str()) {
                        changed.insert(other_id.clone());
                    }
                }
                changed.insert(room_id);
            }

            inner.account_data.extend(account_data);
            inner.spaces.edges.extend(space_edges);
            if let Some(top_level) = top_level_spaces {
                inner.spaces.top_level_spaces = top_level;
            }

            let list_changed = full_rebuild || !changed.is_empty();
            if full_rebuild {
                inner.rebuild_list();
            } else {
                for room_id in &changed {
                    inner.resort(room_id);
                }
            }
            inner.initial_sync_done = true;

            (
                list_changed.then(|| room_list::reversed(&inner.room_list)),
                spaces_changed.then(|| Arc::new(inner.spaces.clone())),
            )
        };

        for (store, changes) in room_changes {
            store.publish(changes);
        }
        for kind in &account_changes {
            self.account_data_subs.notify(kind);
        }
        if let Some(spaces) = spaces {
            self.spaces_subs.emit(spaces);
        }
        if let Some(list) = list {
            self.room_list_subs.emit(list);
        }
    }

    /// Re-evaluate one room's list entry after a change outside sync.
    pub fn refresh_list_entry(&self, room_id: &str) {
        let list = {
            let mut inner = self.write();
            inner.resort(room_id);
            room_list::reversed(&inner.room_list)
        };
        self.room_list_subs.emit(list);
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<RoomStore>> {
        self.read().rooms.get(room_id).cloned()
    }

    /// Room store for `room_id`, created empty if this is its first mention.
    pub fn room_or_create(&self, room_id: &str) -> Arc<RoomStore> {
        if let Some(store) = self.room(room_id) {
            return store;
        }
        self.write()
            .rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| Arc::new(RoomStore::new(room_id)))
            .clone()
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.read().rooms.keys().cloned().collect()
    }

    pub fn invite(&self, room_id: &str) -> Option<InvitedRoom> {
        self.read().invites.get(room_id).cloned()
    }

    /// Current room list, most recent first.
    pub fn room_list(&self) -> RoomList {
        room_list::reversed(&self.read().room_list)
    }

    pub fn account_data(&self, kind: &str) -> Option<AccountData> {
        self.read().account_data.get(kind).cloned()
    }

    pub fn spaces(&self) -> SpaceTree {
        self.read().spaces.clone()
    }

    pub fn initial_sync_done(&self) -> bool {
        self.read().initial_sync_done
    }

    pub fn collect_garbage(&self, room_id: &str, policy: &GcPolicy) -> Option<GcStats> {
        let store = self.room(room_id)?;
        Some(store.collect_garbage(policy))
    }

    pub fn subscribe_room_list(
        &self,
        callback: impl Fn(&RoomList) + Send + Sync + 'static,
    ) -> Subscription {
        self.room_list_subs.listen(callback)
    }

    pub fn subscribe_account_data(
        &self,
        kind: impl Into<String>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.account_data_subs.listen(kind.into(), callback)
    }

    pub fn subscribe_spaces(
        &self,
        callback: impl Fn(&Arc<SpaceTree>) + Send + Sync + 'static,
    ) -> Subscription {
        self.spaces_subs.listen(callback)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use hicli_core::model::{
        CreationContent, Event, EventRowId, NameQuality, Predecessor, StrippedStateEvent,
        SyncRoom, TimelineRowId, TimelineRowTuple, Tombstone, event_type,
    };
    use serde_json::json;

    use super::*;

    fn meta(room_id: &str, sorting_timestamp: i64) -> Room {
        Room {
            room_id: room_id.to_owned(),
            sorting_timestamp,
            ..Room::default()
        }
    }

    fn sync_of(rooms: Vec<Room>) -> SyncComplete {
        SyncComplete {
            rooms: rooms
                .into_iter()
                .map(|room| {
                    let room_id = room.room_id.clone();
                    (
                        room_id,
                        SyncRoom {
                            meta: Some(room),
                            ..SyncRoom::default()
                        },
                    )
                })
                .collect(),
            ..SyncComplete::default()
        }
    }

    fn ids(list: &RoomList) -> Vec<&str> {
        list.iter().map(|entry| entry.room_id.as_str()).collect()
    }

    fn tombstoned(room_id: &str, ts: i64, replacement: &str) -> Room {
        Room {
            tombstone: Some(Tombstone {
                body: "upgraded".to_owned(),
                replacement_room: replacement.to_owned(),
            }),
            ..meta(room_id, ts)
        }
    }

    fn successor(room_id: &str, ts: i64, predecessor: &str) -> Room {
        Room {
            creation_content: Some(CreationContent {
                room_type: None,
                predecessor: Some(Predecessor {
                    room_id: predecessor.to_owned(),
                    event_id: None,
                }),
            }),
            ..meta(room_id, ts)
        }
    }

    #[test]
    fn first_sync_builds_list_newest_first() {
        let store = GlobalStore::new();
        store.apply_sync(sync_of(vec![meta("!a", 10), meta("!b", 30), meta("!c", 20)]));
        assert_eq!(ids(&store.room_list()), vec!["!b", "!c", "!a"]);
        assert!(store.initial_sync_done());
    }

    #[test]
    fn new_message_moves_room_to_top() {
        let store = GlobalStore::new();
        store.apply_sync(sync_of(vec![meta("!a", 10), meta("!b", 30)]));

        let message = Event {
            rowid: EventRowId(1),
            timeline_rowid: TimelineRowId(1),
            room_id: "!a".to_owned(),
            id: "$m".to_owned(),
            sender: "@u:example.org".to_owned(),
            event_type: event_type::MESSAGE.to_owned(),
            timestamp: 50,
            content: json!({ "msgtype": "m.text", "body": "hi" }),
            ..Event::default()
        };
        let mut sync = SyncComplete::default();
        sync.rooms.insert(
            "!a".to_owned(),
            SyncRoom {
                timeline: vec![TimelineRowTuple {
                    timeline_rowid: TimelineRowId(1),
                    event_rowid: EventRowId(1),
                }],
                events: vec![message],
                ..SyncRoom::default()
            },
        );
        store.apply_sync(sync);

        let list = store.room_list();
        assert_eq!(ids(&list), vec!["!a", "!b"]);
        let preview = list[0].preview_event.as_ref().expect("preview should be set");
        assert_eq!(preview.id, "$m");
    }

    #[test]
    fn spaces_are_hidden() {
        let store = GlobalStore::new();
        let space = Room {
            creation_content: Some(CreationContent {
                room_type: Some("m.space".to_owned()),
                predecessor: None,
            }),
            ..meta("!space", 99)
        };
        store.apply_sync(sync_of(vec![space, meta("!chat", 1)]));
        assert_eq!(ids(&store.room_list()), vec!["!chat"]);
        assert!(store.room("!space").is_some());
    }

    #[test]
    fn tombstoned_room_reappears_when_successor_is_left() {
        let store = GlobalStore::new();
        store.apply_sync(sync_of(vec![
            tombstoned("!old", 10, "!new"),
            successor("!new", 20, "!old"),
        ]));
        assert_eq!(ids(&store.room_list()), vec!["!new"]);

        store.apply_sync(SyncComplete {
            left_rooms: vec!["!new".to_owned()],
            ..SyncComplete::default()
        });
        assert_eq!(ids(&store.room_list()), vec!["!old"]);
        assert!(store.room("!new").is_none());
    }

    #[test]
    fn tombstone_without_back_reference_stays_visible() {
        let store = GlobalStore::new();
        store.apply_sync(sync_of(vec![
            tombstoned("!old", 10, "!new"),
            successor("!new", 20, "!someone-else"),
        ]));
        assert_eq!(ids(&store.room_list()), vec!["!new", "!old"]);
    }

    #[test]
    fn successor_joined_later_hides_predecessor() {
        let store = GlobalStore::new();
        store.apply_sync(sync_of(vec![tombstoned("!old", 10, "!new"), meta("!x", 5)]));
        assert_eq!(ids(&store.room_list()), vec!["!old", "!x"]);

        store.apply_sync(sync_of(vec![successor("!new", 20, "!old")]));
        assert_eq!(ids(&store.room_list()), vec!["!new", "!x"]);
    }

    #[test]
    fn invites_are_listed_until_joined_or_left() {
        let store = GlobalStore::new();
        let invite = |room_id: &str| InvitedRoom {
            room_id: room_id.to_owned(),
            created_at: 40,
            invite_state: vec![StrippedStateEvent {
                event_type: event_type::NAME.to_owned(),
                state_key: String::new(),
                sender: "@host:example.org".to_owned(),
                content: json!({ "name": "Party" }),
            }],
        };
        store.apply_sync(SyncComplete {
            invited_rooms: vec![invite("!inv"), invite("!declined")],
            ..sync_of(vec![meta("!a", 10)])
        });
        let list = store.room_list();
        assert_eq!(list.len(), 3);
        assert!(list.iter().filter(|entry| entry.is_invite).all(|entry| entry.name == "Party"));

        store.apply_sync(SyncComplete {
            left_rooms: vec!["!declined".to_owned()],
            ..sync_of(vec![meta("!inv", 50)])
        });
        let list = store.room_list();
        assert_eq!(ids(&list), vec!["!inv", "!a"]);
        assert!(!list[0].is_invite);
        assert!(store.invite("!inv").is_none());
    }

    #[test]
    fn higher_quality_names_win() {
        let store = GlobalStore::new();
        let named = |name: &str, quality: NameQuality| Room {
            name: Some(name.to_owned()),
            name_quality: quality,
            ..meta("!r", 1)
        };
        store.apply_sync(sync_of(vec![named("Alice and Bob", NameQuality::Participants)]));
        store.apply_sync(sync_of(vec![named("#lobby:example.org", NameQuality::CanonicalAlias)]));
        store.apply_sync(sync_of(vec![named("Alice, Bob and Carol", NameQuality::Participants)]));
        assert_eq!(store.room_list()[0].name, "#lobby:example.org");

        store.apply_sync(sync_of(vec![named("Lobby", NameQuality::Explicit)]));
        assert_eq!(store.room_list()[0].name, "Lobby");
    }

    #[test]
    fn room_list_and_account_data_notify_once_per_sync() {
        let store = GlobalStore::new();
        let lists = Arc::new(Mutex::new(Vec::new()));
        let sink = lists.clone();
        let _list_sub = store.subscribe_room_list(move |list| {
            sink.lock().expect("test mutex should lock").push(list.len());
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _data_sub = store.subscribe_account_data("m.direct", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut sync = sync_of(vec![meta("!a", 1), meta("!b", 2)]);
        sync.account_data.insert(
            "m.direct".to_owned(),
            AccountData {
                event_type: "m.direct".to_owned(),
                room_id: None,
                content: json!({}),
            },
        );
        store.apply_sync(sync);
        store.apply_sync(SyncComplete::default());

        assert_eq!(*lists.lock().expect("test mutex should lock"), vec![2]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(store.account_data("m.direct").is_some());
    }

    #[test]
    fn clear_state_drops_rooms() {
        let store = GlobalStore::new();
        store.apply_sync(sync_of(vec![meta("!a", 1)]));
        store.apply_sync(SyncComplete {
            clear_state: true,
            ..sync_of(vec![meta("!b", 2)])
        });
        assert_eq!(ids(&store.room_list()), vec!["!b"]);
        assert!(store.room("!a").is_none());
    }

    #[test]
    fn space_edges_are_published() {
        let store = GlobalStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _sub = store.subscribe_spaces(move |tree| {
            counter.store(tree.top_level_spaces.len(), Ordering::SeqCst);
        });
        let mut sync = SyncComplete {
            top_level_spaces: Some(vec!["!space".to_owned()]),
            ..SyncComplete::default()
        };
        sync.space_edges.insert(
            "!space".to_owned(),
            vec![SpaceEdge {
                child_id: "!child".to_owned(),
                order: None,
                suggested: true,
            }],
        );
        store.apply_sync(sync);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.spaces().edges["!space"][0].child_id, "!child");
    }
}
