//! Environment-backed runtime configuration.

use std::env;

use hicli_store::GcPolicy;
use thiserror::Error;

const DEFAULT_CLIENT_ID: &str = "hicli";
const DEFAULT_USER_ID: &str = "@hicli:localhost";
const DEFAULT_COMMAND_BUFFER: usize = 128;
const DEFAULT_EVENT_BUFFER: usize = 512;
const DEFAULT_PUSH_LOG_CAPACITY: usize = 1024;
const DEFAULT_GC_RECENT_VIEW_SECS: u64 = 60 * 60;
const DEFAULT_GC_INACTIVE_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Prefix of outgoing transaction IDs.
    pub client_id: String,
    /// Sender recorded on local echoes.
    pub user_id: String,
    pub command_buffer: usize,
    pub event_buffer: usize,
    /// Pushed frames retained for resume after reconnect.
    pub push_log_capacity: usize,
    pub gc: GcPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_owned(),
            user_id: DEFAULT_USER_ID.to_owned(),
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
            push_log_capacity: DEFAULT_PUSH_LOG_CAPACITY,
            gc: GcPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = GcPolicy::default();
        let client_id = optional_trimmed_env("HICLI_CLIENT_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_owned());
        let user_id = optional_trimmed_env("HICLI_USER_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER_ID.to_owned());

        let command_buffer =
            parse_positive("HICLI_COMMAND_BUFFER", DEFAULT_COMMAND_BUFFER, &mut lookup)?;
        let event_buffer = parse_positive("HICLI_EVENT_BUFFER", DEFAULT_EVENT_BUFFER, &mut lookup)?;
        let push_log_capacity = parse_positive(
            "HICLI_PUSH_LOG_CAPACITY",
            DEFAULT_PUSH_LOG_CAPACITY,
            &mut lookup,
        )?;

        let recent_view_secs = parse_with_default(
            "HICLI_GC_RECENT_VIEW_SECS",
            DEFAULT_GC_RECENT_VIEW_SECS,
            &mut lookup,
        )?;
        let inactive_secs =
            parse_with_default("HICLI_GC_INACTIVE_SECS", DEFAULT_GC_INACTIVE_SECS, &mut lookup)?;
        let gc = GcPolicy {
            recent_view_ms: secs_to_ms(recent_view_secs),
            inactive_ms: secs_to_ms(inactive_secs),
            target_active: parse_positive(
                "HICLI_GC_TARGET_ACTIVE",
                defaults.target_active,
                &mut lookup,
            )?,
            target_default: parse_positive(
                "HICLI_GC_TARGET_DEFAULT",
                defaults.target_default,
                &mut lookup,
            )?,
            target_inactive: parse_positive(
                "HICLI_GC_TARGET_INACTIVE",
                defaults.target_inactive,
                &mut lookup,
            )?,
            timeline_cap: parse_positive("HICLI_GC_TIMELINE_CAP", defaults.timeline_cap, &mut lookup)?,
            visibility: defaults.visibility,
        };

        Ok(Self {
            client_id,
            user_id,
            command_buffer,
            event_buffer,
            push_log_capacity,
            gc,
        })
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_positive<F>(key: &'static str, default: usize, lookup: &mut F) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let parsed = parse_with_default(key, default, lookup)?;
    if parsed == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(parsed)
}
