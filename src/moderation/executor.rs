//! Punishment executor
//!
//! Applies a case's action on Discord. One `match` arm per action; every
//! platform failure propagates unchanged and nothing is retried here.

use crate::moderation::{Case, CaseAction, ModerationError, ModerationResult, Platform, RoleInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Discord caps audit log reasons at 512 characters
const AUDIT_REASON_LIMIT: usize = 512;

/// Everything a single punishment needs besides the platform
#[derive(Debug, Clone)]
pub struct Punishment<'a> {
    pub case: &'a Case,
    pub action: &'a CaseAction,
    pub mute_role_id: Option<u64>,
    /// Mute: roles already recorded by a superseded mute.
    /// Unmute: roles to give back.
    pub restored_roles: Vec<u64>,
    /// Role mute worked out ahead by `plan_role_mute`
    pub planned_roles: Option<MuteRoleSet>,
}

/// Applies punishments through a `Platform`
#[derive(Clone)]
pub struct PunishmentExecutor {
    platform: Arc<dyn Platform>,
}

impl PunishmentExecutor {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// Work out a role-based mute without touching the member
    ///
    /// # Errors
    ///
    /// Returns `Validation` without a mute role, or the platform error of the
    /// role lookups.
    pub async fn plan_role_mute(
        &self,
        guild_id: u64,
        user_id: u64,
        mute_role_id: Option<u64>,
    ) -> ModerationResult<MuteRoleSet> {
        let mute_role = require_mute_role(mute_role_id)?;
        let current = self.platform.member_roles(guild_id, user_id).await?;
        let catalog = self.platform.role_catalog(guild_id).await?;
        Ok(mute_role_set(&current, &catalog, mute_role))
    }

    /// Apply a punishment.
    ///
    /// Returns the roles a role-based mute took away, which the caller
    /// persists as restored-role rows. Every other action returns nothing.
    ///
    /// # Errors
    ///
    /// Returns the platform error of the failing call, or `Validation` when
    /// a role-based mute has no mute role configured.
    pub async fn apply(&self, punishment: Punishment<'_>) -> ModerationResult<Vec<u64>> {
        let case = punishment.case;
        let guild_id = case.guild_id;
        let user_id = case.target_id;
        let reason = Some(audit_reason(case));

        match punishment.action {
            CaseAction::Warn => {
                info!(guild_id, user_id, case_number = case.case_number, "Warn recorded");
                Ok(Vec::new())
            }
            CaseAction::Mute {
                use_timeouts: true, ..
            } => {
                let until = case.expires_at.ok_or_else(|| {
                    ModerationError::Validation("Timeout mutes need a duration".to_string())
                })?;
                info!("Timing out user {user_id} in guild {guild_id} until {until}");
                self.platform
                    .set_timeout(guild_id, user_id, Some(until), reason)
                    .await?;
                Ok(Vec::new())
            }
            CaseAction::Mute {
                use_timeouts: false,
                ..
            } => {
                let diff = match punishment.planned_roles {
                    Some(plan) => plan,
                    None => {
                        self.plan_role_mute(guild_id, user_id, punishment.mute_role_id)
                            .await?
                    }
                };
                info!(
                    "Muting user {user_id} in guild {guild_id}, storing {} role(s)",
                    diff.removed.len()
                );
                self.platform
                    .set_member_roles(guild_id, user_id, diff.roles, reason)
                    .await?;

                let mut restored = punishment.restored_roles;
                for role in diff.removed {
                    if !restored.contains(&role) {
                        restored.push(role);
                    }
                }
                Ok(restored)
            }
            CaseAction::Unmute { use_timeouts: true } => {
                info!("Clearing timeout of user {user_id} in guild {guild_id}");
                self.platform
                    .set_timeout(guild_id, user_id, None, reason)
                    .await?;
                Ok(Vec::new())
            }
            CaseAction::Unmute {
                use_timeouts: false,
            } => {
                let current = self.platform.member_roles(guild_id, user_id).await?;
                let catalog = self.platform.role_catalog(guild_id).await?;

                let roles = unmute_role_set(
                    &current,
                    &catalog,
                    &punishment.restored_roles,
                    punishment.mute_role_id,
                );
                info!("Unmuting user {user_id} in guild {guild_id}");
                self.platform
                    .set_member_roles(guild_id, user_id, roles, reason)
                    .await?;
                Ok(Vec::new())
            }
            CaseAction::Kick => {
                info!("Kicking user {user_id} from guild {guild_id}");
                self.platform.kick(guild_id, user_id, reason).await?;
                Ok(Vec::new())
            }
            CaseAction::Softban {
                delete_message_days,
            } => {
                info!("Softbanning user {user_id} in guild {guild_id}");
                self.platform
                    .ban(guild_id, user_id, *delete_message_days, reason)
                    .await?;
                self.platform.unban(guild_id, user_id).await?;
                Ok(Vec::new())
            }
            CaseAction::Ban {
                delete_message_days,
                ..
            } => {
                info!("Banning user {user_id} in guild {guild_id}");
                self.platform
                    .ban(guild_id, user_id, *delete_message_days, reason)
                    .await?;
                Ok(Vec::new())
            }
            CaseAction::Unban => {
                info!("Unbanning user {user_id} in guild {guild_id}");
                self.platform.unban(guild_id, user_id).await?;
                Ok(Vec::new())
            }
        }
    }
}

fn require_mute_role(mute_role_id: Option<u64>) -> ModerationResult<u64> {
    mute_role_id.ok_or_else(|| {
        ModerationError::Validation("No mute role configured for role-based mutes".to_string())
    })
}

/// Reason attached to the Discord audit log entry
#[must_use]
pub fn audit_reason(case: &Case) -> String {
    let reason = match &case.reason {
        Some(reason) => format!("Case #{}: {reason}", case.case_number),
        None => format!("Case #{}", case.case_number),
    };
    reason.chars().take(AUDIT_REASON_LIMIT).collect()
}

/// Role set for a role-based mute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteRoleSet {
    /// Roles the member keeps, mute role first
    pub roles: Vec<u64>,
    /// Roles taken away, to restore on unmute
    pub removed: Vec<u64>,
}

/// Swap a member's removable roles for the mute role.
///
/// Managed roles stay on the member. A role missing from the catalog (stale
/// data) also stays and is logged.
#[must_use]
pub fn mute_role_set(current: &[u64], catalog: &[RoleInfo], mute_role: u64) -> MuteRoleSet {
    let catalog: HashMap<u64, &RoleInfo> = catalog.iter().map(|r| (r.id, r)).collect();

    let mut roles = vec![mute_role];
    let mut removed = Vec::new();
    for &role_id in current {
        if role_id == mute_role || roles.contains(&role_id) || removed.contains(&role_id) {
            continue;
        }
        match catalog.get(&role_id) {
            Some(role) if role.managed => roles.push(role_id),
            Some(_) => removed.push(role_id),
            None => {
                warn!(role_id, "Role missing from catalog, keeping it on the member");
                roles.push(role_id);
            }
        }
    }

    MuteRoleSet { roles, removed }
}

/// Role set for undoing a role-based mute.
///
/// Keeps everything the member holds now except the mute role and adds back
/// the recorded roles that still exist and are assignable.
#[must_use]
pub fn unmute_role_set(
    current: &[u64],
    catalog: &[RoleInfo],
    restored: &[u64],
    mute_role: Option<u64>,
) -> Vec<u64> {
    let catalog: HashMap<u64, &RoleInfo> = catalog.iter().map(|r| (r.id, r)).collect();

    let mut roles: Vec<u64> = Vec::new();
    for &role_id in current {
        if Some(role_id) != mute_role && !roles.contains(&role_id) {
            roles.push(role_id);
        }
    }

    for &role_id in restored {
        if Some(role_id) == mute_role || roles.contains(&role_id) {
            continue;
        }
        match catalog.get(&role_id) {
            Some(role) if !role.managed => roles.push(role_id),
            Some(_) => warn!(role_id, "Recorded role is managed now, not restoring it"),
            None => warn!(role_id, "Recorded role no longer exists, not restoring it"),
        }
    }

    roles
}
