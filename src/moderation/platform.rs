//! Discord platform access
//!
//! `Platform` is the narrow set of Discord calls the engine and the
//! reconciliation listener need. `SerenityPlatform` implements it over
//! serenity's HTTP client; tests substitute their own implementations.

use crate::moderation::{ModerationError, ModerationResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{EditMember, GuildId, Http, Permissions, RoleId, UserId};
use serenity::http::HttpError;
use serenity::model::guild::audit_log::{Action, MemberAction};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// How many recent audit entries to scan for a matching target
const AUDIT_LOG_SCAN_LIMIT: u8 = 10;

/// A role from the guild catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleInfo {
    pub id: u64,
    /// Managed by an integration; cannot be removed by the bot
    pub managed: bool,
}

/// Audit entry kinds the reconciliation listener reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    BanAdd,
    BanRemove,
    Kick,
}

impl AuditKind {
    fn action(self) -> Action {
        match self {
            Self::BanAdd => Action::Member(MemberAction::BanAdd),
            Self::BanRemove => Action::Member(MemberAction::BanRemove),
            Self::Kick => Action::Member(MemberAction::Kick),
        }
    }
}

/// One audit log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    /// Who performed the action
    pub actor_id: u64,
    pub target_id: Option<u64>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outbound and read calls against Discord
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    async fn member_roles(&self, guild_id: u64, user_id: u64) -> ModerationResult<Vec<u64>>;

    async fn role_catalog(&self, guild_id: u64) -> ModerationResult<Vec<RoleInfo>>;

    async fn set_member_roles(
        &self,
        guild_id: u64,
        user_id: u64,
        roles: Vec<u64>,
        reason: Option<String>,
    ) -> ModerationResult<()>;

    /// Set or clear (`None`) the native timeout
    async fn set_timeout(
        &self,
        guild_id: u64,
        user_id: u64,
        until: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> ModerationResult<()>;

    async fn kick(&self, guild_id: u64, user_id: u64, reason: Option<String>) -> ModerationResult<()>;

    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        delete_message_days: u8,
        reason: Option<String>,
    ) -> ModerationResult<()>;

    async fn unban(&self, guild_id: u64, user_id: u64) -> ModerationResult<()>;

    /// Whether the bot may read the guild's audit log
    async fn can_view_audit_log(&self, guild_id: u64) -> ModerationResult<bool>;

    /// Most recent audit entry of `kind` whose target is `target_id`
    async fn latest_audit_entry(
        &self,
        guild_id: u64,
        kind: AuditKind,
        target_id: u64,
    ) -> ModerationResult<Option<AuditEntry>>;
}

/// Discord answered 404, e.g. for a member who left
fn is_not_found(error: &serenity::Error) -> bool {
    matches!(
        error,
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response))
            if response.status_code.as_u16() == 404
    )
}

/// `Platform` over serenity's HTTP client
pub struct SerenityPlatform {
    http: Arc<Http>,
    bot_id: OnceCell<UserId>,
}

impl SerenityPlatform {
    #[must_use]
    pub fn new(http: Arc<Http>) -> Self {
        Self {
            http,
            bot_id: OnceCell::new(),
        }
    }

    async fn bot_id(&self) -> ModerationResult<UserId> {
        self.bot_id
            .get_or_try_init(|| async {
                let user = self.http.get_current_user().await?;
                Ok::<_, ModerationError>(user.id)
            })
            .await
            .copied()
    }
}

#[async_trait]
impl Platform for SerenityPlatform {
    async fn member_roles(&self, guild_id: u64, user_id: u64) -> ModerationResult<Vec<u64>> {
        let member = GuildId::new(guild_id)
            .member(&*self.http, UserId::new(user_id))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    ModerationError::NotFound(format!("member {user_id} in guild {guild_id}"))
                } else {
                    e.into()
                }
            })?;
        Ok(member.roles.iter().map(|r| r.get()).collect())
    }

    async fn role_catalog(&self, guild_id: u64) -> ModerationResult<Vec<RoleInfo>> {
        let roles = GuildId::new(guild_id).roles(&*self.http).await?;
        Ok(roles
            .values()
            .map(|role| RoleInfo {
                id: role.id.get(),
                managed: role.managed,
            })
            .collect())
    }

    async fn set_member_roles(
        &self,
        guild_id: u64,
        user_id: u64,
        roles: Vec<u64>,
        reason: Option<String>,
    ) -> ModerationResult<()> {
        let mut builder = EditMember::new().roles(roles.into_iter().map(RoleId::new));
        if let Some(reason) = reason.as_deref() {
            builder = builder.audit_log_reason(reason);
        }
        GuildId::new(guild_id)
            .edit_member(&*self.http, UserId::new(user_id), builder)
            .await?;
        Ok(())
    }

    async fn set_timeout(
        &self,
        guild_id: u64,
        user_id: u64,
        until: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> ModerationResult<()> {
        let mut builder = match until {
            Some(until) => EditMember::new().disable_communication_until_datetime(until.into()),
            None => EditMember::new().enable_communication(),
        };
        if let Some(reason) = reason.as_deref() {
            builder = builder.audit_log_reason(reason);
        }
        GuildId::new(guild_id)
            .edit_member(&*self.http, UserId::new(user_id), builder)
            .await?;
        Ok(())
    }

    async fn kick(&self, guild_id: u64, user_id: u64, reason: Option<String>) -> ModerationResult<()> {
        let guild_id = GuildId::new(guild_id);
        match reason.as_deref() {
            Some(reason) => {
                guild_id
                    .kick_with_reason(&*self.http, UserId::new(user_id), reason)
                    .await?;
            }
            None => guild_id.kick(&*self.http, UserId::new(user_id)).await?,
        }
        Ok(())
    }

    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        delete_message_days: u8,
        reason: Option<String>,
    ) -> ModerationResult<()> {
        let guild_id = GuildId::new(guild_id);
        match reason.as_deref() {
            Some(reason) => {
                guild_id
                    .ban_with_reason(&*self.http, UserId::new(user_id), delete_message_days, reason)
                    .await?;
            }
            None => {
                guild_id
                    .ban(&*self.http, UserId::new(user_id), delete_message_days)
                    .await?;
            }
        }
        Ok(())
    }

    async fn unban(&self, guild_id: u64, user_id: u64) -> ModerationResult<()> {
        GuildId::new(guild_id)
            .unban(&*self.http, UserId::new(user_id))
            .await?;
        Ok(())
    }

    async fn can_view_audit_log(&self, guild_id: u64) -> ModerationResult<bool> {
        let bot_id = self.bot_id().await?;
        let guild = GuildId::new(guild_id).to_partial_guild(&*self.http).await?;
        if guild.owner_id == bot_id {
            return Ok(true);
        }

        let member = guild.member(&*self.http, bot_id).await?;
        let everyone = RoleId::new(guild_id);
        let mut permissions = guild
            .roles
            .get(&everyone)
            .map_or_else(Permissions::empty, |r| r.permissions);
        for role_id in &member.roles {
            if let Some(role) = guild.roles.get(role_id) {
                permissions |= role.permissions;
            }
        }

        Ok(permissions.administrator() || permissions.view_audit_log())
    }

    async fn latest_audit_entry(
        &self,
        guild_id: u64,
        kind: AuditKind,
        target_id: u64,
    ) -> ModerationResult<Option<AuditEntry>> {
        let logs = GuildId::new(guild_id)
            .audit_logs(
                &*self.http,
                Some(kind.action()),
                None,
                None,
                Some(AUDIT_LOG_SCAN_LIMIT),
            )
            .await?;

        let entry = logs
            .entries
            .iter()
            .find(|entry| entry.target_id.is_some_and(|t| t.get() == target_id));

        let Some(entry) = entry else {
            debug!(guild_id, target_id, ?kind, "No matching audit entry");
            return Ok(None);
        };

        let created_at = DateTime::<Utc>::from_timestamp(entry.id.created_at().unix_timestamp(), 0)
            .unwrap_or_else(Utc::now);

        Ok(Some(AuditEntry {
            actor_id: entry.user_id.get(),
            target_id: entry.target_id.map(|t| t.get()),
            reason: entry.reason.clone(),
            created_at,
        }))
    }
}
