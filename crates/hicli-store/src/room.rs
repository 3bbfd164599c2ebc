//! Per-room state: timeline, event indices, current state, and derived caches.
//!
//! Every mutator takes the write lock for its whole duration and collects the
//! resulting notifications in a [`RoomChanges`]. Listeners are only invoked
//! after the lock is released.

use std::{
    collections::{HashMap, HashSet},
    fmt, mem,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use hicli_core::{
    EventDispatcher, MultiNotifier, Subscription, now_ms,
    model::{
        AccountData, Event, EventRowId, EventsDecrypted, EventsFetched, PaginationResult,
        RelationType, Room, SyncRoom, TimelineRowId, TimelineRowTuple, event_type,
    },
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    gc::{GcPolicy, GcStats},
    members::{self, BotCommand, EventIndex, Member, StateMap},
    room_list::RoomListEntry,
};

/// Confirmed timeline followed by unsent local events.
pub type Timeline = Arc<[Arc<Event>]>;
pub type TypingUsers = Arc<[String]>;

/// Target of a read receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkReadParams {
    pub room_id: String,
    pub event_id: String,
    pub event_rowid: EventRowId,
    pub timeline_rowid: TimelineRowId,
}

#[derive(Debug, Default)]
#[must_use]
pub(crate) struct RoomChanges {
    meta: Option<Room>,
    events: HashSet<String>,
    state_types: HashSet<String>,
    state_keys: HashSet<(String, String)>,
    account_data: HashSet<String>,
    timeline: bool,
    timeline_snapshot: Option<Timeline>,
}

impl RoomChanges {
    fn touch_state(&mut self, kind: &str, key: &str) {
        self.state_types.insert(kind.to_owned());
        self.state_keys.insert((kind.to_owned(), key.to_owned()));
    }

    fn touch_meta(&mut self, meta: &Room) {
        self.meta = Some(meta.clone());
    }
}

/// Where a counted reaction was added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReactionRef {
    pub(crate) target: String,
    pub(crate) key: String,
}

#[derive(Debug, Default)]
pub(crate) struct RoomInner {
    pub(crate) meta: Room,
    pub(crate) timeline: Vec<TimelineRowTuple>,
    pub(crate) timeline_index: HashSet<EventRowId>,
    /// Local events rendered after the confirmed timeline.
    pub(crate) pending: Vec<EventRowId>,
    pub(crate) events_by_rowid: EventIndex,
    pub(crate) events_by_id: HashMap<String, EventRowId>,
    pub(crate) state: StateMap,
    pub(crate) account_data: HashMap<String, AccountData>,
    pub(crate) state_loaded: bool,
    pub(crate) full_members_loaded: bool,
    pub(crate) has_more_history: bool,
    pub(crate) requested_events: HashSet<String>,
    pub(crate) members_cache: Option<Arc<[Member]>>,
    pub(crate) bot_commands_cache: Option<Arc<[BotCommand]>>,
    pub(crate) last_marked_read: Option<TimelineRowId>,
    pub(crate) last_viewed_ms: Option<i64>,
    /// Reaction event ID to the target it was counted on. Outlives the
    /// reaction row itself so redelivery and redaction stay exact.
    pub(crate) counted_reactions: HashMap<String, ReactionRef>,
    /// Target event ID to reactions (`reaction ID -> key`) seen before it.
    pub(crate) waiting_reactions: HashMap<String, HashMap<String, String>>,
}

/// Carry locally known aggregates over to a redelivered copy of an event.
fn merge_existing(event: &mut Event, existing: &Event) {
    if event.reactions.is_empty() {
        event.reactions = existing.reactions.clone();
    }
    if event.last_edit_rowid.is_none() {
        event.last_edit_rowid = existing.last_edit_rowid;
    }
    if event.decrypted.is_none() && existing.decrypted.is_some() {
        event.decrypted = existing.decrypted.clone();
        event.decrypted_type = existing.decrypted_type.clone();
        event.decryption_error = None;
    }
    if event.redacted_by.is_none()
        && let Some(redacted_by) = &existing.redacted_by
    {
        event.redact(redacted_by);
    }
}

fn resolve_timeline_rowid(event: &Event, existing: Option<&Event>, pending: bool) -> TimelineRowId {
    if pending {
        return TimelineRowId::pending(event.timestamp);
    }
    if event.timeline_rowid.is_assigned() {
        return event.timeline_rowid;
    }
    match existing {
        Some(existing) if existing.timeline_rowid != TimelineRowId::default() => {
            existing.timeline_rowid
        }
        _ if event.is_local_echo() => TimelineRowId::pending(event.timestamp),
        _ => event.timeline_rowid,
    }
}

impl RoomInner {
    fn new(room_id: &str) -> Self {
        Self {
            meta: Room::new(room_id),
            has_more_history: true,
            ..Self::default()
        }
    }

    fn in_timeline(&self, rowid: EventRowId) -> bool {
        self.timeline_index.contains(&rowid) || self.pending.contains(&rowid)
    }

    fn event_by_id(&self, event_id: &str) -> Option<&Arc<Event>> {
        self.events_by_rowid.get(self.events_by_id.get(event_id)?)
    }

    /// Copy-on-write update of an indexed event. Returns its event ID.
    fn modify_event(&mut self, rowid: EventRowId, f: impl FnOnce(&mut Event)) -> Option<String> {
        let event = Arc::make_mut(self.events_by_rowid.get_mut(&rowid)?);
        f(event);
        Some(event.id.clone())
    }

    fn invalidate_caches(&mut self, kind: &str) {
        match kind {
            event_type::MEMBER | event_type::POWER_LEVELS => self.members_cache = None,
            event_type::BOT_COMMANDS => self.bot_commands_cache = None,
            _ => {}
        }
    }

    pub(crate) fn timeline_snapshot(&self) -> Timeline {
        let mut overlay: Vec<Arc<Event>> = self
            .pending
            .iter()
            .filter_map(|rowid| self.events_by_rowid.get(rowid).cloned())
            .collect();
        overlay.sort_by_key(|event| (event.timestamp, event.rowid));

        self.timeline
            .iter()
            .filter_map(|tuple| self.events_by_rowid.get(&tuple.event_rowid).cloned())
            .chain(overlay)
            .collect()
    }

    fn seal(&self, mut changes: RoomChanges) -> RoomChanges {
        if changes.timeline {
            changes.timeline_snapshot = Some(self.timeline_snapshot());
        }
        changes
    }

    /// Shared ingestion routine for every entry point. Idempotent per row ID.
    fn apply_event(&mut self, mut event: Event, pending: bool, changes: &mut RoomChanges) {
        let rowid = event.rowid;
        let existing = self.events_by_rowid.get(&rowid).cloned();
        let supplied_reactions = !event.reactions.is_empty();
        if let Some(existing) = &existing {
            merge_existing(&mut event, existing);
        }
        event.parse_relation();
        event.pending = pending;
        event.timeline_rowid = resolve_timeline_rowid(&event, existing.as_deref(), pending);
        event.last_edit = event
            .last_edit_rowid
            .and_then(|edit_rowid| self.events_by_rowid.get(&edit_rowid).cloned());

        let newly_indexed = existing.as_ref().is_none_or(|old| old.id != event.id);
        if let Some(old) = &existing
            && old.id != event.id
        {
            self.events_by_id.remove(&old.id);
            changes.events.insert(old.id.clone());
        }

        let event = Arc::new(event);
        self.events_by_rowid.insert(rowid, event.clone());
        self.events_by_id.insert(event.id.clone(), rowid);

        if newly_indexed {
            self.resolve_waiting_reactions(&event.id, supplied_reactions, changes);
        }
        if event.is_edit() {
            self.link_edit(&event, changes);
        }
        if event.redacted_by.is_some() {
            self.uncount_reaction(&event.id, changes);
        } else if event.relation_type == Some(RelationType::Annotation)
            && let (Some(target), Some(key)) = (&event.relates_to, &event.reaction_key)
        {
            self.count_reaction(&event.id, target, key, changes);
        }
        if existing.is_none()
            && let Some(target) = event.redacts()
        {
            self.apply_redaction(target, &event.id, changes);
        }

        self.requested_events.remove(&event.id);
        if pending {
            if !self.pending.contains(&rowid) {
                self.pending.push(rowid);
            }
        } else if event.timeline_rowid.is_assigned() || self.timeline_index.contains(&rowid) {
            self.pending.retain(|pending_rowid| *pending_rowid != rowid);
        }

        changes.events.insert(event.id.clone());
        if self.in_timeline(rowid) {
            changes.timeline = true;
        }
    }

    /// Point the edit target at `edit` if it is the newest edit by the same sender.
    fn link_edit(&mut self, edit: &Arc<Event>, changes: &mut RoomChanges) {
        let Some(target_rowid) = edit
            .relates_to
            .as_deref()
            .and_then(|target| self.events_by_id.get(target))
            .copied()
        else {
            return;
        };
        let Some(target) = self.events_by_rowid.get(&target_rowid) else {
            return;
        };
        if target.sender != edit.sender || target.redacted_by.is_some() {
            return;
        }

        let supersedes = match target.last_edit_rowid {
            None => true,
            Some(current) if current == edit.rowid => true,
            Some(current) => match self.events_by_rowid.get(&current) {
                Some(current) => (edit.timestamp, edit.rowid) > (current.timestamp, current.rowid),
                None => edit.rowid > current,
            },
        };
        if !supersedes {
            return;
        }

        let edit = edit.clone();
        if let Some(target_id) = self.modify_event(target_rowid, |target| {
            target.last_edit_rowid = Some(edit.rowid);
            target.last_edit = Some(edit);
        }) {
            changes.events.insert(target_id);
        }
        if self.in_timeline(target_rowid) {
            changes.timeline = true;
        }
    }

    /// Count a reaction once per reaction ID, or park it until its target arrives.
    fn count_reaction(&mut self, reaction_id: &str, target: &str, key: &str, changes: &mut RoomChanges) {
        if self.counted_reactions.contains_key(reaction_id) {
            return;
        }
        if !self.events_by_id.contains_key(target) {
            self.waiting_reactions
                .entry(target.to_owned())
                .or_default()
                .insert(reaction_id.to_owned(), key.to_owned());
            return;
        }
        self.counted_reactions.insert(
            reaction_id.to_owned(),
            ReactionRef {
                target: target.to_owned(),
                key: key.to_owned(),
            },
        );
        self.adjust_reaction(target, key, 1, changes);
    }

    fn uncount_reaction(&mut self, reaction_id: &str, changes: &mut RoomChanges) {
        if let Some(reaction) = self.counted_reactions.remove(reaction_id) {
            self.adjust_reaction(&reaction.target, &reaction.key, -1, changes);
            return;
        }
        self.waiting_reactions.retain(|_, waiting| {
            waiting.remove(reaction_id);
            !waiting.is_empty()
        });
    }

    /// Count reactions that arrived before `target_id`. An aggregate delivered
    /// with the target already includes them.
    fn resolve_waiting_reactions(&mut self, target_id: &str, supplied: bool, changes: &mut RoomChanges) {
        let Some(waiting) = self.waiting_reactions.remove(target_id) else {
            return;
        };
        for (reaction_id, key) in waiting {
            if !supplied {
                self.adjust_reaction(target_id, &key, 1, changes);
            }
            self.counted_reactions.insert(
                reaction_id,
                ReactionRef {
                    target: target_id.to_owned(),
                    key,
                },
            );
        }
    }

    fn adjust_reaction(&mut self, target_id: &str, key: &str, delta: i64, changes: &mut RoomChanges) {
        let Some(rowid) = self.events_by_id.get(target_id).copied() else {
            return;
        };
        let updated = self.modify_event(rowid, |target| {
            let count = target.reactions.entry(key.to_owned()).or_insert(0);
            *count += delta;
            if *count <= 0 {
                target.reactions.remove(key);
            }
        });
        if let Some(id) = updated {
            changes.events.insert(id);
        }
        if self.in_timeline(rowid) {
            changes.timeline = true;
        }
    }

    fn apply_redaction(&mut self, target_id: &str, redaction_id: &str, changes: &mut RoomChanges) {
        self.uncount_reaction(target_id, changes);
        let Some(target_rowid) = self.events_by_id.get(target_id).copied() else {
            return;
        };
        let Some(target) = self.events_by_rowid.get(&target_rowid).cloned() else {
            return;
        };
        if target.redacted_by.is_some() {
            return;
        }

        if target.is_edit()
            && let Some(original_rowid) = target
                .relates_to
                .as_deref()
                .and_then(|original| self.events_by_id.get(original))
                .copied()
            && self
                .events_by_rowid
                .get(&original_rowid)
                .is_some_and(|original| original.last_edit_rowid == Some(target_rowid))
        {
            if let Some(id) = self.modify_event(original_rowid, |original| {
                original.last_edit_rowid = None;
                original.last_edit = None;
            }) {
                changes.events.insert(id);
            }
            if self.in_timeline(original_rowid) {
                changes.timeline = true;
            }
        }

        self.modify_event(target_rowid, |target| target.redact(redaction_id));
        changes.events.insert(target_id.to_owned());
        if self.in_timeline(target_rowid) {
            changes.timeline = true;
        }
    }

    fn append_timeline(&mut self, tuples: Vec<TimelineRowTuple>) -> Vec<EventRowId> {
        let mut appended = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            if self.timeline_index.insert(tuple.event_rowid) {
                self.timeline.push(tuple);
                appended.push(tuple.event_rowid);
            }
        }
        self.sort_timeline();
        appended
    }

    fn sort_timeline(&mut self) {
        if !self.timeline.is_sorted_by_key(|tuple| tuple.timeline_rowid) {
            self.timeline.sort_by_key(|tuple| tuple.timeline_rowid);
        }
    }

    fn drop_confirmed_from_overlay(&mut self) {
        let confirmed = &self.timeline_index;
        self.pending.retain(|rowid| !confirmed.contains(rowid));
    }

    /// Move the sorting timestamp and preview pointer for new timeline rows.
    fn track_latest(&mut self, appended: &[EventRowId], now: i64, changes: &mut RoomChanges) {
        let mut changed = false;
        for rowid in appended {
            let Some(event) = self.events_by_rowid.get(rowid) else {
                continue;
            };
            if event.bumps_sorting_timestamp() {
                changed |= self.meta.bump_sorting_timestamp(event.timestamp, now);
            }
            if event.can_use_for_preview() && self.meta.preview_event_rowid != Some(*rowid) {
                self.meta.preview_event_rowid = Some(*rowid);
                changed = true;
            }
        }
        if changed {
            changes.touch_meta(&self.meta);
        }
    }

    fn apply_sync(&mut self, sync: SyncRoom, now: i64) -> RoomChanges {
        let SyncRoom {
            meta,
            timeline,
            state,
            account_data,
            events,
            reset,
        } = sync;
        let mut changes = RoomChanges::default();

        if let Some(meta) = meta
            && self.meta.merge(meta, now)
        {
            changes.touch_meta(&self.meta);
        }
        for event in events {
            self.apply_event(event, false, &mut changes);
        }
        for (kind, keys) in state {
            for (key, rowid) in keys {
                let previous = self
                    .state
                    .entry(kind.clone())
                    .or_default()
                    .insert(key.clone(), rowid);
                if previous != Some(rowid) {
                    self.invalidate_caches(&kind);
                    changes.touch_state(&kind, &key);
                }
            }
        }
        for (kind, data) in account_data {
            self.account_data.insert(kind.clone(), data);
            changes.account_data.insert(kind);
        }

        if reset {
            self.timeline.clear();
            self.timeline_index.clear();
            self.has_more_history = true;
        }
        let appended = self.append_timeline(timeline);
        self.drop_confirmed_from_overlay();
        self.track_latest(&appended, now, &mut changes);

        changes.timeline = true;
        changes
    }

    fn apply_pagination(&mut self, result: PaginationResult) -> RoomChanges {
        let PaginationResult {
            mut events,
            related_events,
            has_more,
            ..
        } = result;
        let mut changes = RoomChanges::default();

        // Rows without a position go directly before the current oldest row.
        let mut floor = self
            .timeline
            .first()
            .map_or(0, |tuple| tuple.timeline_rowid.0);
        for event in &mut events {
            if !event.timeline_rowid.is_assigned() {
                floor -= 1;
                if floor == 0 {
                    floor -= 1;
                }
                event.timeline_rowid = TimelineRowId(floor);
            }
        }

        let mut older = Vec::with_capacity(events.len());
        for event in events.into_iter().rev() {
            let tuple = TimelineRowTuple {
                timeline_rowid: event.timeline_rowid,
                event_rowid: event.rowid,
            };
            self.apply_event(event, false, &mut changes);
            if self.timeline_index.insert(tuple.event_rowid) {
                older.push(tuple);
            }
        }
        older.append(&mut self.timeline);
        self.timeline = older;
        self.sort_timeline();
        self.drop_confirmed_from_overlay();

        for event in related_events {
            self.apply_event(event, false, &mut changes);
        }

        self.has_more_history = has_more;
        changes.timeline = true;
        changes
    }

    fn apply_decrypted(&mut self, result: EventsDecrypted) -> (RoomChanges, bool) {
        let mut changes = RoomChanges::default();
        for decrypted in result.events {
            let Some(existing) = self.events_by_rowid.get(&decrypted.rowid) else {
                continue;
            };
            let mut merged = Event::clone(existing);
            merged.decrypted = decrypted.decrypted;
            merged.decrypted_type = decrypted.decrypted_type;
            merged.decryption_error = decrypted.decryption_error;
            let pending = merged.pending;
            self.apply_event(merged, pending, &mut changes);
        }

        let mut preview_changed = false;
        if let Some(preview) = result.preview_event_rowid
            && self.meta.preview_event_rowid != Some(preview)
        {
            self.meta.preview_event_rowid = Some(preview);
            changes.touch_meta(&self.meta);
            preview_changed = true;
        }
        (changes, preview_changed)
    }

    fn apply_state(&mut self, event: Event) -> RoomChanges {
        let mut changes = RoomChanges::default();
        let Some(key) = event.state_key.clone() else {
            warn!(room_id = %self.meta.room_id, event_id = %event.id, "ignoring state update without state key");
            return changes;
        };
        let kind = event.event_type.clone();
        let rowid = event.rowid;

        self.apply_event(event, false, &mut changes);
        self.state
            .entry(kind.clone())
            .or_default()
            .insert(key.clone(), rowid);
        self.invalidate_caches(&kind);
        changes.touch_state(&kind, &key);
        changes
    }

    fn apply_full_state(&mut self, events: Vec<Event>, omit_members: bool) -> RoomChanges {
        let mut changes = RoomChanges::default();
        let mut next = StateMap::new();
        for event in events {
            if let Some(key) = &event.state_key {
                next.entry(event.event_type.clone())
                    .or_default()
                    .insert(key.clone(), event.rowid);
            }
            self.apply_event(event, false, &mut changes);
        }
        if omit_members && let Some(members) = self.state.remove(event_type::MEMBER) {
            next.insert(event_type::MEMBER.to_owned(), members);
        }

        let previous = mem::replace(&mut self.state, next);
        for (kind, keys) in previous.iter().chain(self.state.iter()) {
            for key in keys.keys() {
                changes.touch_state(kind, key);
            }
        }

        self.state_loaded = true;
        if !omit_members {
            self.full_members_loaded = true;
        }
        self.members_cache = None;
        self.bot_commands_cache = None;
        changes
    }

    fn mark_as_read_params(&mut self) -> Option<MarkReadParams> {
        for tuple in self.timeline.iter().rev() {
            if self
                .last_marked_read
                .is_some_and(|last| tuple.timeline_rowid <= last)
            {
                return None;
            }
            let Some(event) = self.events_by_rowid.get(&tuple.event_rowid) else {
                continue;
            };
            if event.pending || event.is_local_echo() {
                continue;
            }
            let params = MarkReadParams {
                room_id: self.meta.room_id.clone(),
                event_id: event.id.clone(),
                event_rowid: event.rowid,
                timeline_rowid: tuple.timeline_rowid,
            };
            self.last_marked_read = Some(tuple.timeline_rowid);
            return Some(params);
        }
        None
    }
}

/// State of one room plus its subscription channels.
pub struct RoomStore {
    room_id: String,
    inner: RwLock<RoomInner>,
    meta_subs: EventDispatcher<Room>,
    timeline_subs: EventDispatcher<Timeline>,
    typing_subs: EventDispatcher<TypingUsers>,
    event_subs: MultiNotifier<String>,
    state_subs: MultiNotifier<String>,
    state_key_subs: MultiNotifier<(String, String)>,
    account_data_subs: MultiNotifier<String>,
}

impl fmt::Debug for RoomStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomStore")
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}

impl RoomStore {
    pub fn new(room_id: impl Into<String>) -> Self {
        let room_id = room_id.into();
        Self {
            inner: RwLock::new(RoomInner::new(&room_id)),
            room_id,
            meta_subs: EventDispatcher::new(),
            timeline_subs: EventDispatcher::new(),
            typing_subs: EventDispatcher::with_value(Arc::from(Vec::new())),
            event_subs: MultiNotifier::new(),
            state_subs: MultiNotifier::new(),
            state_key_subs: MultiNotifier::new(),
            account_data_subs: MultiNotifier::new(),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, RoomInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, RoomInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire the notifications collected by a mutator. Must run without the lock held.
    pub(crate) fn publish(&self, changes: RoomChanges) {
        for event_id in &changes.events {
            self.event_subs.notify(event_id);
        }
        for kind in &changes.state_types {
            self.state_subs.notify(kind);
        }
        for key in &changes.state_keys {
            self.state_key_subs.notify(key);
        }
        for kind in &changes.account_data {
            self.account_data_subs.notify(kind);
        }
        if let Some(meta) = changes.meta {
            self.meta_subs.emit(meta);
        }
        if let Some(timeline) = changes.timeline_snapshot {
            self.timeline_subs.emit(timeline);
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut RoomInner) -> RoomChanges) {
        let changes = {
            let mut inner = self.write();
            let changes = f(&mut inner);
            inner.seal(changes)
        };
        self.publish(changes);
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn meta(&self) -> Room {
        self.read().meta.clone()
    }

    pub fn has_more_history(&self) -> bool {
        self.read().has_more_history
    }

    pub fn state_loaded(&self) -> bool {
        self.read().state_loaded
    }

    pub fn full_members_loaded(&self) -> bool {
        self.read().full_members_loaded
    }

    pub fn event_by_rowid(&self, rowid: EventRowId) -> Option<Arc<Event>> {
        self.read().events_by_rowid.get(&rowid).cloned()
    }

    pub fn event_by_id(&self, event_id: &str) -> Option<Arc<Event>> {
        self.read().event_by_id(event_id).cloned()
    }

    pub fn state_event(&self, kind: &str, key: &str) -> Option<Arc<Event>> {
        let inner = self.read();
        let rowid = inner.state.get(kind)?.get(key)?;
        inner.events_by_rowid.get(rowid).cloned()
    }

    pub fn state_keys(&self, kind: &str) -> Vec<String> {
        self.read()
            .state
            .get(kind)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn account_data(&self, kind: &str) -> Option<AccountData> {
        self.read().account_data.get(kind).cloned()
    }

    pub fn timeline(&self) -> Timeline {
        self.read().timeline_snapshot()
    }

    /// Oldest confirmed timeline position, the anchor for backwards pagination.
    pub fn oldest_timeline_rowid(&self) -> Option<TimelineRowId> {
        self.read()
            .timeline
            .first()
            .map(|tuple| tuple.timeline_rowid)
    }

    pub fn typing(&self) -> TypingUsers {
        self.typing_subs
            .current()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    pub fn list_entry(&self) -> RoomListEntry {
        let inner = self.read();
        let preview = inner
            .meta
            .preview_event_rowid
            .and_then(|rowid| inner.events_by_rowid.get(&rowid).cloned());
        RoomListEntry::from_room(&inner.meta, preview)
    }

    /// Whether applying `sync` would change this room's room-list entry.
    pub(crate) fn list_entry_changed(&self, sync: &SyncRoom) -> bool {
        let inner = self.read();
        let current = &inner.meta;
        let meta_changed = sync.meta.as_ref().is_some_and(|meta| {
            (meta.name_quality >= current.name_quality && meta.name != current.name)
                || meta.avatar != current.avatar
                || meta.dm_user_id != current.dm_user_id
                || meta.sorting_timestamp != current.sorting_timestamp
                || meta.unread_messages != current.unread_messages
                || meta.unread_notifications != current.unread_notifications
                || meta.unread_highlights != current.unread_highlights
                || meta.marked_unread != current.marked_unread
                || meta.preview_event_rowid != current.preview_event_rowid
                || meta.lazy_load_summary != current.lazy_load_summary
                || meta.creation_content != current.creation_content
                || meta.tombstone != current.tombstone
        });
        let preview_rowid = sync
            .meta
            .as_ref()
            .and_then(|meta| meta.preview_event_rowid)
            .or(current.preview_event_rowid);
        meta_changed
            || sync.events.iter().any(|event| {
                Some(event.rowid) == preview_rowid
                    || event.can_use_for_preview()
                    || (event.bumps_sorting_timestamp()
                        && event.timestamp > current.sorting_timestamp)
            })
    }

    pub fn apply_sync(&self, sync: SyncRoom) {
        let changes = self.apply_sync_deferred(sync);
        self.publish(changes);
    }

    pub(crate) fn apply_sync_deferred(&self, sync: SyncRoom) -> RoomChanges {
        let mut inner = self.write();
        let changes = inner.apply_sync(sync, now_ms());
        inner.seal(changes)
    }

    /// Insert a local echo. Returns `false` if the row is already known.
    pub fn apply_pending(&self, event: Event) -> bool {
        let mut applied = false;
        self.mutate(|inner| {
            let mut changes = RoomChanges::default();
            if inner.events_by_rowid.contains_key(&event.rowid) {
                debug!(room_id = %self.room_id, rowid = event.rowid.0, "local echo already superseded");
                return changes;
            }
            let rowid = event.rowid;
            let synthetic = event.is_synthetic();
            inner.apply_event(event, !synthetic, &mut changes);
            if synthetic && !inner.pending.contains(&rowid) {
                inner.pending.push(rowid);
            }
            applied = true;
            changes.timeline = true;
            changes
        });
        applied
    }

    pub fn apply_send_complete(&self, event: Event) {
        self.mutate(|inner| {
            let mut changes = RoomChanges::default();
            if inner
                .events_by_rowid
                .get(&event.rowid)
                .is_some_and(|existing| !existing.pending)
            {
                return changes;
            }
            let rowid = event.rowid;
            inner.apply_event(event, false, &mut changes);
            if !inner.timeline_index.contains(&rowid) && !inner.pending.contains(&rowid) {
                inner.pending.push(rowid);
            }
            changes.timeline = true;
            changes
        });
    }

    /// Put a failed local echo back into the pending state for another attempt.
    pub fn apply_resend(&self, event: Event) {
        self.mutate(|inner| {
            let mut changes = RoomChanges::default();
            inner.apply_event(event, true, &mut changes);
            changes.timeline = true;
            changes
        });
    }

    pub fn apply_pagination(&self, result: PaginationResult) {
        self.mutate(|inner| inner.apply_pagination(result));
    }

    /// Apply decryption results. Returns whether the preview pointer moved.
    pub fn apply_decrypted(&self, result: EventsDecrypted) -> bool {
        let mut preview_changed = false;
        self.mutate(|inner| {
            let (changes, moved) = inner.apply_decrypted(result);
            preview_changed = moved;
            changes
        });
        preview_changed
    }

    /// Index individually fetched events. They do not join the timeline.
    pub fn apply_fetched(&self, result: EventsFetched) {
        self.mutate(|inner| {
            let mut changes = RoomChanges::default();
            for event in result.events {
                inner.apply_event(event, false, &mut changes);
            }
            changes
        });
    }

    pub fn apply_state(&self, event: Event) {
        self.mutate(|inner| inner.apply_state(event));
    }

    pub fn apply_full_state(&self, events: Vec<Event>, omit_members: bool) {
        self.mutate(|inner| inner.apply_full_state(events, omit_members));
    }

    pub fn set_typing(&self, user_ids: Vec<String>) {
        let next: TypingUsers = user_ids.into();
        if self.typing_subs.current().as_deref() == Some(&*next) {
            return;
        }
        self.typing_subs.emit(next);
    }

    /// Sorted member list, rebuilt lazily after member or power-level changes.
    pub fn members(&self) -> Arc<[Member]> {
        if let Some(cached) = self.read().members_cache.clone() {
            return cached;
        }
        let mut inner = self.write();
        if let Some(cached) = inner.members_cache.clone() {
            return cached;
        }
        let built: Arc<[Member]> =
            members::build_member_list(&inner.state, &inner.events_by_rowid).into();
        inner.members_cache = Some(built.clone());
        built
    }

    pub fn bot_commands(&self) -> Arc<[BotCommand]> {
        if let Some(cached) = self.read().bot_commands_cache.clone() {
            return cached;
        }
        let mut inner = self.write();
        if let Some(cached) = inner.bot_commands_cache.clone() {
            return cached;
        }
        let built: Arc<[BotCommand]> =
            members::build_bot_commands(&inner.state, &inner.events_by_rowid).into();
        inner.bot_commands_cache = Some(built.clone());
        built
    }

    /// Newest confirmed event to send a read receipt for, if it was not
    /// already returned by an earlier call.
    pub fn mark_as_read_params(&self) -> Option<MarkReadParams> {
        self.write().mark_as_read_params()
    }

    /// Record that `event_id` is being fetched. Returns `false` if it is
    /// already indexed or already requested.
    pub fn mark_event_requested(&self, event_id: &str) -> bool {
        let mut inner = self.write();
        if inner.events_by_id.contains_key(event_id) {
            return false;
        }
        inner.requested_events.insert(event_id.to_owned())
    }

    /// Allow a new fetch of `event_id` after one ended without applying it.
    pub fn forget_event_request(&self, event_id: &str) {
        self.write().requested_events.remove(event_id);
    }

    pub fn mark_viewed(&self) {
        self.write().last_viewed_ms = Some(now_ms());
    }

    pub fn collect_garbage(&self, policy: &GcPolicy) -> GcStats {
        let mut stats = GcStats::default();
        self.mutate(|inner| {
            stats = inner.collect_garbage(policy, now_ms());
            RoomChanges {
                timeline: stats.events_discarded > 0,
                ..RoomChanges::default()
            }
        });
        stats
    }

    pub fn subscribe_meta(&self, callback: impl Fn(&Room) + Send + Sync + 'static) -> Subscription {
        self.meta_subs.listen(callback)
    }

    pub fn subscribe_timeline(
        &self,
        callback: impl Fn(&Timeline) + Send + Sync + 'static,
    ) -> Subscription {
        self.timeline_subs.listen(callback)
    }

    pub fn subscribe_typing(
        &self,
        callback: impl Fn(&TypingUsers) + Send + Sync + 'static,
    ) -> Subscription {
        self.typing_subs.listen(callback)
    }

    pub fn subscribe_event(
        &self,
        event_id: impl Into<String>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.event_subs.listen(event_id.into(), callback)
    }

    pub fn subscribe_state(
        &self,
        kind: impl Into<String>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.state_subs.listen(kind.into(), callback)
    }

    pub fn subscribe_state_key(
        &self,
        kind: impl Into<String>,
        key: impl Into<String>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.state_key_subs
            .listen((kind.into(), key.into()), callback)
    }

    pub fn subscribe_account_data(
        &self,
        kind: impl Into<String>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.account_data_subs.listen(kind.into(), callback)
    }
}
