//! Per-room memory trimming.

use std::{
    collections::{HashMap, HashSet},
    mem,
};

use hicli_core::model::{EventRowId, VisibilityPrefs, event_type};
use serde::Serialize;
use tracing::debug;

use crate::{members::StateMap, room::RoomInner};

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Retention settings for [`RoomStore::collect_garbage`](crate::RoomStore::collect_garbage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcPolicy {
    /// Rooms viewed within this window keep `target_active` visible events.
    pub recent_view_ms: i64,
    /// Rooms neither viewed nor active within this window keep `target_inactive`.
    pub inactive_ms: i64,
    pub target_active: usize,
    pub target_default: usize,
    pub target_inactive: usize,
    pub timeline_cap: usize,
    pub visibility: VisibilityPrefs,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            recent_view_ms: HOUR_MS,
            inactive_ms: 7 * 24 * HOUR_MS,
            target_active: 100,
            target_default: 50,
            target_inactive: 10,
            timeline_cap: 1000,
            visibility: VisibilityPrefs::default(),
        }
    }
}

impl GcPolicy {
    pub fn retention_target(&self, last_viewed_ms: Option<i64>, last_activity_ms: i64, now_ms: i64) -> usize {
        let viewed_within = |window: i64| last_viewed_ms.is_some_and(|viewed| now_ms - viewed <= window);
        let target = if viewed_within(self.recent_view_ms) {
            self.target_active
        } else if viewed_within(self.inactive_ms) || now_ms - last_activity_ms <= self.inactive_ms {
            self.target_default
        } else {
            self.target_inactive
        };
        target.max(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub events_discarded: usize,
    pub state_discarded: usize,
    pub target: usize,
}

fn count_rows(state: &StateMap) -> usize {
    state.values().map(|keys| keys.len()).sum()
}

impl RoomInner {
    /// Index of the oldest timeline entry to keep.
    fn retention_start(&self, policy: &GcPolicy, target: usize) -> usize {
        let len = self.timeline.len();
        let cap = policy.timeline_cap.max(1);
        let mut keep_from = len;
        let mut visible = 0;
        while keep_from > 0 && len - keep_from < cap && visible < target {
            keep_from -= 1;
            let rowid = self.timeline[keep_from].event_rowid;
            if self
                .events_by_rowid
                .get(&rowid)
                .is_some_and(|event| event.is_visible(&policy.visibility))
            {
                visible += 1;
            }
        }
        keep_from
    }

    /// Counts on a discarded target are gone with it. A retained reaction
    /// waits to be counted again if the target comes back.
    fn release_discarded_reaction_targets(&mut self) {
        let counted = mem::take(&mut self.counted_reactions);
        for (reaction_id, reaction) in counted {
            if self.events_by_id.contains_key(&reaction.target) {
                self.counted_reactions.insert(reaction_id, reaction);
            } else if self.events_by_id.contains_key(&reaction_id) {
                self.waiting_reactions
                    .entry(reaction.target)
                    .or_default()
                    .insert(reaction_id, reaction.key);
            }
        }
    }

    pub(crate) fn collect_garbage(&mut self, policy: &GcPolicy, now_ms: i64) -> GcStats {
        let target = policy.retention_target(self.last_viewed_ms, self.meta.sorting_timestamp, now_ms);
        let keep_from = self.retention_start(policy, target);
        let trimmed = keep_from > 0;
        self.timeline.drain(..keep_from);
        self.timeline_index = self.timeline.iter().map(|tuple| tuple.event_rowid).collect();

        let mut keep: HashSet<EventRowId> = self.timeline_index.clone();
        keep.extend(self.pending.iter().copied());
        keep.extend(self.meta.preview_event_rowid);
        let edits: Vec<EventRowId> = keep
            .iter()
            .filter_map(|rowid| self.events_by_rowid.get(rowid)?.last_edit_rowid)
            .collect();
        keep.extend(edits);

        let senders: HashSet<&str> = keep
            .iter()
            .filter_map(|rowid| self.events_by_rowid.get(rowid))
            .map(|event| event.sender.as_str())
            .collect();
        let mut state = StateMap::new();
        if let Some(members) = self.state.get(event_type::MEMBER) {
            let retained: HashMap<_, _> = members
                .iter()
                .filter(|(user_id, _)| senders.contains(user_id.as_str()))
                .map(|(user_id, rowid)| (user_id.clone(), *rowid))
                .collect();
            if !retained.is_empty() {
                state.insert(event_type::MEMBER.to_owned(), retained);
            }
        }
        if let Some(packs) = self.state.get(event_type::EMOTE_PACK) {
            state.insert(event_type::EMOTE_PACK.to_owned(), packs.clone());
        }
        let state_discarded = count_rows(&self.state) - count_rows(&state);
        keep.extend(state.values().flat_map(|keys| keys.values().copied()));
        self.state = state;

        let before = self.events_by_rowid.len();
        self.events_by_rowid.retain(|rowid, _| keep.contains(rowid));
        self.events_by_id.retain(|_, rowid| keep.contains(rowid));
        let events_discarded = before - self.events_by_rowid.len();
        self.release_discarded_reaction_targets();

        self.state_loaded = false;
        self.full_members_loaded = false;
        self.members_cache = None;
        self.bot_commands_cache = None;
        self.requested_events.clear();
        if trimmed {
            self.has_more_history = true;
        }

        debug!(
            room_id = %self.meta.room_id,
            target,
            events_discarded,
            state_discarded,
            "collected room garbage"
        );
        GcStats {
            events_discarded,
            state_discarded,
            target,
        }
    }
}
