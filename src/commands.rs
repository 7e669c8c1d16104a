use crate::moderation::{Case, ModerationError, format_action_name};
use crate::{Context, Error};
use poise::command;
use std::fmt::Write as _;

/// Show a moderation case
/// Looks up a case of this server by its number.
#[command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn case(
    ctx: Context<'_>,
    #[description = "Case number"] number: u64,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let reply = match ctx.data().engine.find_case(guild_id.get(), number).await {
        Ok(case) => describe_case(&case),
        Err(ModerationError::NotFound(_)) => format!("There is no case #{number}."),
        Err(e) => return Err(e.into()),
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Pardon a warn
/// A pardoned warn no longer counts toward automatic punishments.
#[command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn pardon(
    ctx: Context<'_>,
    #[description = "Case number of the warn"] number: u64,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let moderator_id = ctx.author().id.get();
    let reply = match ctx.data().engine.pardon(guild_id.get(), number, moderator_id).await {
        Ok(case) => format!("Warn #{} against {} is pardoned.", case.case_number, case.target_tag),
        Err(ModerationError::NotFound(_)) => format!("There is no case #{number}."),
        Err(ModerationError::Validation(message)) => message,
        Err(e) => return Err(e.into()),
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Change the reason of a case
#[command(slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn reason(
    ctx: Context<'_>,
    #[description = "Case number"] number: u64,
    #[description = "New reason, empty to clear"] text: Option<String>,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let reply = match ctx.data().engine.update_reason(guild_id.get(), number, text).await {
        Ok(case) => describe_case(&case),
        Err(ModerationError::NotFound(_)) => format!("There is no case #{number}."),
        Err(e) => return Err(e.into()),
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Text shown for a case
#[must_use]
pub fn describe_case(case: &Case) -> String {
    let mut text = format!(
        "**Case #{}** | {}\nTarget: {} (<@{}>)",
        case.case_number,
        format_action_name(case.action),
        case.target_tag,
        case.target_id
    );

    match (&case.moderator_tag, case.moderator_id) {
        (Some(tag), _) => {
            let _ = write!(text, "\nModerator: {tag}");
        }
        (None, Some(id)) => {
            let _ = write!(text, "\nModerator: <@{id}>");
        }
        (None, None) => text.push_str("\nModerator: automatic"),
    }
    if let Some(reason) = &case.reason {
        let _ = write!(text, "\nReason: {reason}");
    }
    if let Some(ref_id) = case.ref_id {
        let _ = write!(text, "\nReferences: #{ref_id}");
    }
    if let Some(expires_at) = case.expires_at {
        let verb = if case.is_pending_reversal() { "Expires" } else { "Ended" };
        let _ = write!(text, "\n{verb}: <t:{}:R>", expires_at.timestamp());
    }
    if let Some(pardoned_by) = case.pardoned_by {
        let _ = write!(text, "\nPardoned by <@{pardoned_by}>");
    }
    text
}
