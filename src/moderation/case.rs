//! Case records and their auxiliary rows
//!
//! A `Case` is immutable once finalized, apart from the fields a `CasePatch`
//! may touch: pardon, expiry, reference, reason and the processed flag.

use crate::moderation::ActionType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum stored reason length, in characters
pub const MAX_REASON_LENGTH: usize = 512;

/// One recorded moderation decision against a guild member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    /// Global surrogate key
    pub id: Uuid,
    /// Sequential number within the guild, starting at 1
    pub case_number: u64,
    pub guild_id: u64,
    pub target_id: u64,
    pub target_tag: String,
    pub action: ActionType,
    /// `None` means the case was created automatically
    pub moderator_id: Option<u64>,
    pub moderator_tag: Option<String>,
    pub reason: Option<String>,
    /// Case number of a related case in the same guild
    pub ref_id: Option<u64>,
    /// Only set for timed mutes and bans
    pub expires_at: Option<DateTime<Utc>>,
    /// Mute/unmute through the native timeout field instead of roles
    pub use_timeouts: bool,
    /// Warn only: who pardoned it
    pub pardoned_by: Option<u64>,
    /// Set once a timed case has been reversed or superseded
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl Case {
    /// Create an unnumbered case; the store assigns `case_number` on insert
    pub fn new(guild_id: u64, target_id: u64, target_tag: impl Into<String>, action: ActionType) -> Self {
        Self {
            id: Uuid::new_v4(),
            case_number: 0,
            guild_id,
            target_id,
            target_tag: target_tag.into(),
            action,
            moderator_id: None,
            moderator_tag: None,
            reason: None,
            ref_id: None,
            expires_at: None,
            use_timeouts: false,
            pardoned_by: None,
            processed: false,
            created_at: Utc::now(),
        }
    }

    /// Whether this case is a mute or ban still waiting for reversal
    #[must_use]
    pub fn is_pending_reversal(&self) -> bool {
        self.action.can_expire() && self.expires_at.is_some() && !self.processed
    }

    /// Age of the case at `now`
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Clip a reason to the stored maximum
#[must_use]
pub fn bound_reason(reason: Option<String>) -> Option<String> {
    reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .map(|r| {
            if r.chars().count() > MAX_REASON_LENGTH {
                r.chars().take(MAX_REASON_LENGTH).collect()
            } else {
                r
            }
        })
}

/// A role a member held before a role-based mute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RestoredRole {
    pub case_id: Uuid,
    pub role_id: u64,
}

/// A pending reversal of a timed case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledReversal {
    pub case_id: Uuid,
    pub guild_id: u64,
    pub run_at: DateTime<Utc>,
}

/// Criteria for case lookups; unset fields match anything
#[derive(Debug, Clone, Default)]
pub struct CaseFilter {
    pub case_number: Option<u64>,
    pub target_id: Option<u64>,
    pub action: Option<ActionType>,
    pub processed: Option<bool>,
    /// Case number the case points at
    pub ref_id: Option<u64>,
    /// Only warns without a pardon
    pub unpardoned: bool,
}

impl CaseFilter {
    #[must_use]
    pub fn number(case_number: u64) -> Self {
        Self {
            case_number: Some(case_number),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn target(target_id: u64) -> Self {
        Self {
            target_id: Some(target_id),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn action(mut self, action: ActionType) -> Self {
        self.action = Some(action);
        self
    }

    #[must_use]
    pub fn unprocessed(mut self) -> Self {
        self.processed = Some(false);
        self
    }

    #[must_use]
    pub fn references(mut self, case_number: u64) -> Self {
        self.ref_id = Some(case_number);
        self
    }

    #[must_use]
    pub fn unpardoned(mut self) -> Self {
        self.unpardoned = true;
        self
    }

    /// Check a case against this filter
    #[must_use]
    pub fn matches(&self, case: &Case) -> bool {
        self.case_number.is_none_or(|n| case.case_number == n)
            && self.target_id.is_none_or(|t| case.target_id == t)
            && self.action.is_none_or(|a| case.action == a)
            && self.processed.is_none_or(|p| case.processed == p)
            && self.ref_id.is_none_or(|r| case.ref_id == Some(r))
            && (!self.unpardoned || case.pardoned_by.is_none())
    }
}

/// The mutable subset of a case
#[derive(Debug, Clone, Default)]
pub struct CasePatch {
    pub pardoned_by: Option<u64>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub ref_id: Option<u64>,
    pub reason: Option<Option<String>>,
    pub processed: Option<bool>,
}

impl CasePatch {
    #[must_use]
    pub fn processed() -> Self {
        Self {
            processed: Some(true),
            ..Default::default()
        }
    }

    /// Apply the patch in place
    pub fn apply(&self, case: &mut Case) {
        if let Some(moderator) = self.pardoned_by {
            case.pardoned_by = Some(moderator);
        }
        if let Some(expires_at) = self.expires_at {
            case.expires_at = expires_at;
        }
        if let Some(ref_id) = self.ref_id {
            case.ref_id = Some(ref_id);
        }
        if let Some(reason) = &self.reason {
            case.reason = bound_reason(reason.clone());
        }
        if let Some(processed) = self.processed {
            case.processed = processed;
        }
    }
}
