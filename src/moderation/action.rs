//! Moderation action types
//!
//! `ActionType` is the flat tag stored on every case. `CaseAction` is the
//! tagged union handed to the engine, where each variant carries only the
//! parameters its punishment needs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default message-deletion window for softbans, in days
pub const DEFAULT_SOFTBAN_DELETE_DAYS: u8 = 1;

/// Discord refuses deletion windows longer than a week
pub const MAX_DELETE_MESSAGE_DAYS: u8 = 7;

/// Type of moderation action recorded on a case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Warn,
    Mute,
    Unmute,
    Kick,
    Softban,
    Ban,
    Unban,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warn => write!(f, "Warn"),
            Self::Mute => write!(f, "Mute"),
            Self::Unmute => write!(f, "Unmute"),
            Self::Kick => write!(f, "Kick"),
            Self::Softban => write!(f, "Softban"),
            Self::Ban => write!(f, "Ban"),
            Self::Unban => write!(f, "Unban"),
        }
    }
}

impl ActionType {
    /// Whether cases of this type may carry an expiry
    #[must_use]
    pub fn can_expire(self) -> bool {
        matches!(self, Self::Mute | Self::Ban)
    }

    /// The action that undoes a timed action
    #[must_use]
    pub fn reversal(self) -> Option<Self> {
        match self {
            Self::Mute => Some(Self::Unmute),
            Self::Ban => Some(Self::Unban),
            _ => None,
        }
    }

    /// The timed action this type closes, if it is a reversal
    #[must_use]
    pub fn reverses(self) -> Option<Self> {
        match self {
            Self::Unmute => Some(Self::Mute),
            Self::Unban => Some(Self::Ban),
            _ => None,
        }
    }

    /// Past-tense verb used in direct messages
    #[must_use]
    pub fn past_tense(self) -> &'static str {
        match self {
            Self::Warn => "warned",
            Self::Mute => "muted",
            Self::Unmute => "unmuted",
            Self::Kick => "kicked",
            Self::Softban => "softbanned",
            Self::Ban => "banned",
            Self::Unban => "unbanned",
        }
    }

    /// Key segment used for lock keys
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Mute => "mute",
            Self::Unmute => "unmute",
            Self::Kick => "kick",
            Self::Softban => "softban",
            Self::Ban => "ban",
            Self::Unban => "unban",
        }
    }
}

/// Human readable verb for an action, as shown by confirmation prompts
#[must_use]
pub fn format_action_name(action: ActionType) -> &'static str {
    action.key()
}

/// A moderation action with the parameters its punishment needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseAction {
    /// Record only
    Warn,

    /// Native timeout or mute-role swap
    Mute {
        duration: Option<Duration>,
        use_timeouts: bool,
    },

    /// Undo a mute applied the same way
    Unmute { use_timeouts: bool },

    /// Remove the member from the guild
    Kick,

    /// Ban then unban to purge messages
    Softban { delete_message_days: u8 },

    /// Guild ban
    Ban {
        duration: Option<Duration>,
        delete_message_days: u8,
    },

    /// Remove a ban entry
    Unban,
}

impl CaseAction {
    /// Get the type of this action
    #[must_use]
    pub fn get_type(&self) -> ActionType {
        match self {
            Self::Warn => ActionType::Warn,
            Self::Mute { .. } => ActionType::Mute,
            Self::Unmute { .. } => ActionType::Unmute,
            Self::Kick => ActionType::Kick,
            Self::Softban { .. } => ActionType::Softban,
            Self::Ban { .. } => ActionType::Ban,
            Self::Unban => ActionType::Unban,
        }
    }

    /// Duration of a timed action, ignoring non-positive values
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Mute { duration, .. } | Self::Ban { duration, .. } => {
                duration.filter(|d| *d > Duration::zero())
            }
            _ => None,
        }
    }

    /// When the action should be reversed, relative to `now`
    #[must_use]
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration().map(|d| now + d)
    }

    /// Whether the mute/unmute goes through the native timeout field
    #[must_use]
    pub fn use_timeouts(&self) -> bool {
        match self {
            Self::Mute { use_timeouts, .. } | Self::Unmute { use_timeouts } => *use_timeouts,
            _ => false,
        }
    }

    /// Create a new `Mute` action
    pub fn mute(duration: impl Into<Option<Duration>>, use_timeouts: bool) -> Self {
        Self::Mute {
            duration: duration.into(),
            use_timeouts,
        }
    }

    /// Create a new `Ban` action
    pub fn ban(duration: impl Into<Option<Duration>>, delete_message_days: u8) -> Self {
        Self::Ban {
            duration: duration.into(),
            delete_message_days: delete_message_days.min(MAX_DELETE_MESSAGE_DAYS),
        }
    }

    /// Create a new `Softban` action
    #[must_use]
    pub fn softban(delete_message_days: u8) -> Self {
        Self::Softban {
            delete_message_days: delete_message_days.min(MAX_DELETE_MESSAGE_DAYS),
        }
    }
}

/// Render a duration as "2 hours 5 minutes"
#[must_use]
pub fn humanize_duration(duration: Duration) -> String {
    const UNITS: [(&str, i64); 4] = [("day", 86_400), ("hour", 3_600), ("minute", 60), ("second", 1)];

    let mut remaining = duration.num_seconds().max(0);
    let mut parts = Vec::new();
    for (name, secs) in UNITS {
        let count = remaining / secs;
        if count > 0 {
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{count} {name}{plural}"));
            remaining %= secs;
        }
    }

    if parts.is_empty() {
        "0 seconds".to_string()
    } else {
        parts.join(" ")
    }
}
