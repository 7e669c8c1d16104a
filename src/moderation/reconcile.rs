//! Reconciliation of actions taken outside the bot
//!
//! Bans, unbans and kicks done through the Discord client still need a case.
//! The listener checks the audit log, the action locks and the most recent
//! matching case, and records the action without re-applying it unless the
//! engine already did. A softban shows up as a ban and an unban.

use crate::moderation::{
    ActionType, AuditEntry, AuditKind, Case, CaseAction, CaseEngine, CaseFilter, CreateCase,
    ModerationResult, Platform,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

/// Gateway events the listener cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    BanAdded {
        guild_id: u64,
        user_id: u64,
        user_tag: String,
    },
    BanRemoved {
        guild_id: u64,
        user_id: u64,
        user_tag: String,
    },
    /// A member left; a kick if the audit log says so
    MemberRemoved {
        guild_id: u64,
        user_id: u64,
        user_tag: String,
    },
}

impl PlatformEvent {
    fn parts(&self) -> (u64, u64, &str) {
        match self {
            Self::BanAdded {
                guild_id,
                user_id,
                user_tag,
            }
            | Self::BanRemoved {
                guild_id,
                user_id,
                user_tag,
            }
            | Self::MemberRemoved {
                guild_id,
                user_id,
                user_tag,
            } => (*guild_id, *user_id, user_tag),
        }
    }

    fn audit_kind(&self) -> AuditKind {
        match self {
            Self::BanAdded { .. } => AuditKind::BanAdd,
            Self::BanRemoved { .. } => AuditKind::BanRemove,
            Self::MemberRemoved { .. } => AuditKind::Kick,
        }
    }

    fn action(&self) -> CaseAction {
        match self {
            Self::BanAdded { .. } => CaseAction::ban(None, 0),
            Self::BanRemoved { .. } => CaseAction::Unban,
            Self::MemberRemoved { .. } => CaseAction::Kick,
        }
    }

    /// Case types the engine writes for actions that cause this event
    fn covering_actions(&self) -> &'static [ActionType] {
        match self {
            Self::BanAdded { .. } => &[ActionType::Ban, ActionType::Softban],
            Self::BanRemoved { .. } => &[ActionType::Unban, ActionType::Softban],
            Self::MemberRemoved { .. } => &[ActionType::Kick],
        }
    }

    /// Whether `case` is one the engine would have written for this event
    fn covered_by(&self, case: &Case) -> bool {
        // A ban that was since lifted does not explain a new one
        self.covering_actions().contains(&case.action)
            && !(case.action == ActionType::Ban && case.processed)
    }
}

/// Turns gateway events into cases
pub struct ReconciliationListener {
    engine: Arc<CaseEngine>,
    platform: Arc<dyn Platform>,
    bot_id: u64,
}

impl ReconciliationListener {
    pub fn new(engine: Arc<CaseEngine>, platform: Arc<dyn Platform>, bot_id: u64) -> Self {
        Self {
            engine,
            platform,
            bot_id,
        }
    }

    /// Record an externally performed action.
    ///
    /// Returns the synthesized case, or `None` when the event was skipped or
    /// suppressed.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit log or the store cannot be read, or if
    /// the case cannot be recorded.
    pub async fn reconcile(&self, event: PlatformEvent) -> ModerationResult<Option<Case>> {
        let (guild_id, user_id, user_tag) = event.parts();
        let window = self.engine.settings().engine.reconcile_window();
        let now = Utc::now();

        if !self.platform.can_view_audit_log(guild_id).await? {
            debug!(guild_id, "Audit log not readable, skipping reconciliation");
            return Ok(None);
        }

        let kind = event.audit_kind();
        let entry = self
            .platform
            .latest_audit_entry(guild_id, kind, user_id)
            .await?;

        if kind == AuditKind::Kick {
            // Without a fresh kick entry the member left on their own
            match &entry {
                Some(entry) if now - entry.created_at <= window => {}
                _ => return Ok(None),
            }
        }

        if entry.as_ref().is_some_and(|e| e.actor_id == self.bot_id) {
            debug!(guild_id, user_id, ?kind, "Action performed by the bot itself");
            return Ok(None);
        }

        for &action in event.covering_actions() {
            if let Some(case) = self.engine.is_locked(action, user_id, guild_id).await? {
                debug!(
                    guild_id,
                    user_id,
                    case_number = case.case_number,
                    "Locked case already covers this event"
                );
                return Ok(None);
            }
        }

        let history = {
            let mut tx = self.engine.store().begin(guild_id).await?;
            tx.find_cases(&CaseFilter::target(user_id)).await?
        };
        let recent = history
            .iter()
            .rev()
            .find(|case| event.covered_by(case));
        if let Some(case) = recent {
            if case.age(now) < window {
                debug!(
                    guild_id,
                    user_id,
                    case_number = case.case_number,
                    "Recent case already covers this event"
                );
                return Ok(None);
            }
        }

        let input = synthesized_input(guild_id, user_id, user_tag, event.action(), entry.as_ref());
        let outcome = self.engine.create(input).await?;
        info!(
            guild_id,
            user_id,
            case_number = outcome.case.case_number,
            action = %outcome.case.action,
            "Recorded action taken outside the bot"
        );
        Ok(Some(outcome.case))
    }
}

fn synthesized_input(
    guild_id: u64,
    user_id: u64,
    user_tag: &str,
    action: CaseAction,
    entry: Option<&AuditEntry>,
) -> CreateCase {
    let mut input = CreateCase::new(guild_id, user_id, user_tag, action).record_only();
    if let Some(entry) = entry {
        input = input.moderator(entry.actor_id, format!("<@{}>", entry.actor_id));
        input.reason = entry.reason.clone();
    }
    input
}
