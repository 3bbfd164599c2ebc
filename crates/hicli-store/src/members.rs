//! Derived member and bot-command lists, rebuilt from the current state map.

use std::{collections::HashMap, sync::Arc};

use hicli_core::model::{Event, EventRowId, event_type};
use serde::Serialize;
use serde_json::Value;

pub(crate) type StateMap = HashMap<String, HashMap<String, EventRowId>>;
pub(crate) type EventIndex = HashMap<EventRowId, Arc<Event>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub membership: String,
    pub power_level: i64,
}

impl Member {
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotCommand {
    pub bot_user_id: String,
    pub syntax: String,
    pub description: Option<String>,
}

fn state_event<'a>(
    state: &StateMap,
    events: &'a EventIndex,
    kind: &str,
    key: &str,
) -> Option<&'a Arc<Event>> {
    let rowid = state.get(kind)?.get(key)?;
    events.get(rowid)
}

fn string_field(content: &Value, field: &str) -> Option<String> {
    content
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

struct PowerLevels<'a> {
    users: Option<&'a serde_json::Map<String, Value>>,
    users_default: i64,
}

impl<'a> PowerLevels<'a> {
    fn from_state(state: &StateMap, events: &'a EventIndex) -> Self {
        let content = state_event(state, events, event_type::POWER_LEVELS, "")
            .map(|event| event.get_content());
        Self {
            users: content
                .and_then(|content| content.get("users"))
                .and_then(Value::as_object),
            users_default: content
                .and_then(|content| content.get("users_default"))
                .and_then(Value::as_i64)
                .unwrap_or(0),
        }
    }

    fn for_user(&self, user_id: &str) -> i64 {
        self.users
            .and_then(|users| users.get(user_id))
            .and_then(Value::as_i64)
            .unwrap_or(self.users_default)
    }
}

/// Joined and invited members, highest power level first, then by name.
pub(crate) fn build_member_list(state: &StateMap, events: &EventIndex) -> Vec<Member> {
    let Some(member_state) = state.get(event_type::MEMBER) else {
        return Vec::new();
    };
    let power = PowerLevels::from_state(state, events);

    let mut members: Vec<Member> = member_state
        .iter()
        .filter_map(|(user_id, rowid)| {
            let content = events.get(rowid)?.get_content();
            let membership = string_field(content, "membership")?;
            if membership != "join" && membership != "invite" {
                return None;
            }
            Some(Member {
                user_id: user_id.clone(),
                display_name: string_field(content, "displayname"),
                avatar_url: string_field(content, "avatar_url"),
                membership,
                power_level: power.for_user(user_id),
            })
        })
        .collect();

    members.sort_by(|a, b| {
        b.power_level
            .cmp(&a.power_level)
            .then_with(|| a.name().to_lowercase().cmp(&b.name().to_lowercase()))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    members
}

/// Commands advertised by bots through their per-user state event.
pub(crate) fn build_bot_commands(state: &StateMap, events: &EventIndex) -> Vec<BotCommand> {
    let Some(command_state) = state.get(event_type::BOT_COMMANDS) else {
        return Vec::new();
    };

    let mut commands: Vec<BotCommand> = command_state
        .iter()
        .filter_map(|(bot_user_id, rowid)| Some((bot_user_id, events.get(rowid)?)))
        .flat_map(|(bot_user_id, event)| {
            event
                .get_content()
                .get("commands")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(move |command| {
                    Some(BotCommand {
                        bot_user_id: bot_user_id.clone(),
                        syntax: string_field(command, "syntax")?,
                        description: string_field(command, "description"),
                    })
                })
        })
        .collect();

    commands.sort_by(|a, b| {
        a.syntax
            .cmp(&b.syntax)
            .then_with(|| a.bot_user_id.cmp(&b.bot_user_id))
    });
    commands
}
