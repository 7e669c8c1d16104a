//! Warn escalation
//!
//! After a warn is staged, the member's unpardoned warns are counted and the
//! guild's rule for exactly that count, if any, yields one follow-up case.
//! The follow-up never escalates again.

use crate::config::GuildConfig;
use crate::moderation::{
    ActionType, Case, CaseAction, CaseFilter, CaseTransaction, ModerationResult, validate_action,
};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// A case synthesized by escalation, not yet inserted
#[derive(Debug, Clone)]
pub struct Escalation {
    pub case: Case,
    pub action: CaseAction,
}

/// Evaluate the guild's warn rules for a freshly staged warn
///
/// # Errors
///
/// Returns an error only if the store fails while counting warns.
pub async fn evaluate(
    tx: &mut dyn CaseTransaction,
    guild: &GuildConfig,
    softban_delete_message_days: u8,
    warn_case: &Case,
    now: DateTime<Utc>,
) -> ModerationResult<Option<Escalation>> {
    if warn_case.action != ActionType::Warn {
        return Ok(None);
    }

    let filter = CaseFilter::target(warn_case.target_id)
        .action(ActionType::Warn)
        .unpardoned();
    let count = tx.find_cases(&filter).await?.len();
    let Ok(count) = u32::try_from(count) else {
        return Ok(None);
    };

    let Some(rule) = guild.warn_punishment(count) else {
        return Ok(None);
    };

    let action = match rule.action {
        ActionType::Mute => CaseAction::mute(
            rule.duration(),
            guild.use_timeouts || guild.mute_role_id.is_none(),
        ),
        ActionType::Kick => CaseAction::Kick,
        ActionType::Softban => CaseAction::softban(softban_delete_message_days),
        ActionType::Ban => CaseAction::ban(rule.duration(), guild.ban_delete_message_days),
        ActionType::Warn | ActionType::Unmute | ActionType::Unban => {
            warn!(
                guild_id = guild.guild_id,
                warn_count = count,
                action = %rule.action,
                "Warn rule uses an action that cannot escalate, ignoring it"
            );
            return Ok(None);
        }
    };

    if let Err(e) = validate_action(&action, guild) {
        warn!(
            guild_id = guild.guild_id,
            warn_count = count,
            error = %e,
            "Warn rule cannot be applied, skipping escalation"
        );
        return Ok(None);
    }

    let mut case = Case::new(
        warn_case.guild_id,
        warn_case.target_id,
        warn_case.target_tag.clone(),
        action.get_type(),
    );
    case.ref_id = Some(warn_case.case_number);
    case.reason = Some(format!("Automatic action: reached {count} warnings"));
    case.expires_at = action.expires_at(now);
    case.use_timeouts = action.use_timeouts();
    case.created_at = now;

    info!(
        guild_id = guild.guild_id,
        target_id = warn_case.target_id,
        warn_count = count,
        action = %case.action,
        "Warn threshold reached"
    );

    Ok(Some(Escalation { case, action }))
}
