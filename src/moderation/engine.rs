//! Case engine
//!
//! `create` is the single entry point for recording a moderation action. It
//! numbers and stores the case in one guild transaction, closes the timed case
//! it supersedes and evaluates warn escalation. Only after the commit does it
//! message the member, apply the action on Discord, write the action locks and
//! publish the batch.

use crate::config::{GuildConfig, Settings};
use crate::moderation::escalation;
use crate::moderation::executor::{MuteRoleSet, Punishment, PunishmentExecutor};
use crate::moderation::notifier::notification_text;
use crate::moderation::{
    ActionType, CASE_FINALIZED, Case, CaseAction, CaseFilter, CasePatch, CaseStore,
    CaseTransaction, EventPublisher, LockKey, LockService, ModerationError, ModerationResult,
    Notifier, Platform, RestoredRole, ScheduledReversal, bound_reason,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest native timeout Discord accepts
pub const MAX_TIMEOUT_DAYS: i64 = 28;

/// Reject actions that can never be applied in this guild
///
/// # Errors
///
/// Returns `Validation` for a timeout mute without a duration or longer than
/// 28 days, and for a role mute in a guild without a mute role.
pub fn validate_action(action: &CaseAction, guild: &GuildConfig) -> ModerationResult<()> {
    match action {
        CaseAction::Mute {
            use_timeouts: true, ..
        } => match action.duration() {
            None => Err(ModerationError::Validation(
                "Timeout mutes need a duration".to_string(),
            )),
            Some(duration) if duration > Duration::days(MAX_TIMEOUT_DAYS) => Err(
                ModerationError::Validation(format!(
                    "Timeouts cannot be longer than {MAX_TIMEOUT_DAYS} days"
                )),
            ),
            Some(_) => Ok(()),
        },
        CaseAction::Mute {
            use_timeouts: false,
            ..
        } if guild.mute_role_id.is_none() => Err(ModerationError::Validation(
            "No mute role is configured for this server".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Moderator responsible for a case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moderator {
    pub id: u64,
    pub tag: String,
}

/// Input of `CaseEngine::create`
#[derive(Debug, Clone)]
pub struct CreateCase {
    pub guild_id: u64,
    pub target_id: u64,
    pub target_tag: String,
    pub action: CaseAction,
    /// `None` for automatic actions
    pub moderator: Option<Moderator>,
    pub reason: Option<String>,
    pub ref_id: Option<u64>,
    /// Roles to give back on unmute instead of the recorded ones
    pub restored_roles: Option<Vec<u64>>,
    pub notify_user: bool,
    pub apply_action: bool,
}

impl CreateCase {
    pub fn new(guild_id: u64, target_id: u64, target_tag: impl Into<String>, action: CaseAction) -> Self {
        Self {
            guild_id,
            target_id,
            target_tag: target_tag.into(),
            action,
            moderator: None,
            reason: None,
            ref_id: None,
            restored_roles: None,
            notify_user: true,
            apply_action: true,
        }
    }

    #[must_use]
    pub fn moderator(mut self, id: u64, tag: impl Into<String>) -> Self {
        self.moderator = Some(Moderator { id, tag: tag.into() });
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Record the case without messaging the member or touching Discord
    #[must_use]
    pub fn record_only(mut self) -> Self {
        self.notify_user = false;
        self.apply_action = false;
        self
    }
}

/// Result of a successful `create`
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    pub case: Case,
    /// Case produced by warn escalation
    pub escalated: Option<Case>,
}

/// A committed case waiting for its side effects
struct Staged {
    case: Case,
    action: CaseAction,
    /// Mute: roles carried over from the superseded mute.
    /// Unmute: roles to give back.
    restored_roles: Vec<u64>,
    /// Role mute closed by this case, whose rows move or get consumed
    closes: Option<Uuid>,
    /// Undoes the superseded mute first when the mute style changes
    lift: Option<CaseAction>,
}

/// Records, applies and reverses moderation cases
pub struct CaseEngine {
    store: Arc<dyn CaseStore>,
    locks: Arc<dyn LockService>,
    platform: Arc<dyn Platform>,
    executor: PunishmentExecutor,
    notifier: Arc<dyn Notifier>,
    publisher: Arc<dyn EventPublisher>,
    settings: Arc<Settings>,
}

impl CaseEngine {
    pub fn new(
        store: Arc<dyn CaseStore>,
        locks: Arc<dyn LockService>,
        platform: Arc<dyn Platform>,
        notifier: Arc<dyn Notifier>,
        publisher: Arc<dyn EventPublisher>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            locks,
            executor: PunishmentExecutor::new(Arc::clone(&platform)),
            platform,
            notifier,
            publisher,
            settings,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CaseStore> {
        &self.store
    }

    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Record a moderation action and carry it out.
    ///
    /// # Errors
    ///
    /// - `Validation` if the action cannot be applied in this guild; nothing
    ///   is written.
    /// - `Store` or `Timeout` if the transaction fails; nothing is written.
    /// - `ActionNotApplied` if the cases were committed but Discord rejected
    ///   the action. Locks and the published batch still happened.
    pub async fn create(&self, input: CreateCase) -> ModerationResult<CreateOutcome> {
        let guild = self.settings.guild(input.guild_id);
        validate_action(&input.action, &guild)?;

        let deadline = self.settings.engine.transaction_timeout();
        let staged = tokio::time::timeout(deadline, self.record(&input, &guild))
            .await
            .map_err(|_| ModerationError::Timeout(deadline))??;

        let mut failure = None;
        for entry in &staged {
            if input.notify_user {
                self.notify(&entry.case, &guild).await;
            }

            let applied = if input.apply_action {
                if let Err(e) = self.apply_staged(entry, &guild).await {
                    error!(
                        guild_id = entry.case.guild_id,
                        case_number = entry.case.case_number,
                        action = %entry.case.action,
                        error = %e,
                        "Case recorded but the action failed"
                    );
                    failure = Some(ModerationError::not_applied(&entry.case, e));
                    break;
                }
                true
            } else {
                false
            };

            if let Err(e) = self.settle_roles(entry, applied).await {
                error!(
                    case_number = entry.case.case_number,
                    error = %e,
                    "Failed to store restored roles"
                );
                failure = Some(ModerationError::not_applied(&entry.case, e));
                break;
            }
        }

        for entry in &staged {
            self.lock(&entry.case).await;
        }

        let mut cases: Vec<Case> = staged.into_iter().map(|entry| entry.case).collect();
        self.publisher.publish(CASE_FINALIZED, cases.clone());

        if let Some(e) = failure {
            return Err(e);
        }

        let escalated = (cases.len() > 1).then(|| cases.remove(1));
        let case = cases
            .into_iter()
            .next()
            .ok_or_else(|| ModerationError::Other("No case was recorded".to_string()))?;
        Ok(CreateOutcome { case, escalated })
    }

    /// Transaction phase of `create`
    async fn record(&self, input: &CreateCase, guild: &GuildConfig) -> ModerationResult<Vec<Staged>> {
        let now = Utc::now();
        let mut tx = self.store.begin(input.guild_id).await?;

        let mut case = Case::new(
            input.guild_id,
            input.target_id,
            input.target_tag.clone(),
            input.action.get_type(),
        );
        if let Some(moderator) = &input.moderator {
            case.moderator_id = Some(moderator.id);
            case.moderator_tag = Some(moderator.tag.clone());
        }
        case.reason = bound_reason(input.reason.clone());
        case.ref_id = input.ref_id;
        case.created_at = now;

        let first = stage(
            tx.as_mut(),
            case,
            input.action.clone(),
            input.restored_roles.clone(),
        )
        .await?;
        let mut staged = vec![first];

        if staged[0].case.action == ActionType::Warn {
            let softban_days = self.settings.engine.softban_delete_message_days;
            match escalation::evaluate(tx.as_mut(), guild, softban_days, &staged[0].case, now).await {
                Ok(Some(escalation)) => {
                    staged.push(stage(tx.as_mut(), escalation.case, escalation.action, None).await?);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    guild_id = input.guild_id,
                    target_id = input.target_id,
                    error = %e,
                    "Warn escalation lookup failed, skipping it"
                ),
            }
        }

        tx.commit().await?;

        for entry in &staged {
            info!(
                guild_id = entry.case.guild_id,
                case_number = entry.case.case_number,
                target_id = entry.case.target_id,
                action = %entry.case.action,
                moderator_id = ?entry.case.moderator_id,
                "Case recorded"
            );
        }
        Ok(staged)
    }

    async fn notify(&self, case: &Case, guild: &GuildConfig) {
        let text = notification_text(case, guild.name.as_deref());
        if !self.notifier.send_direct_message(case.target_id, text).await {
            debug!(
                target_id = case.target_id,
                case_number = case.case_number,
                "Member was not notified"
            );
        }
    }

    /// Carry out a committed case on Discord.
    ///
    /// A role mute stores its restored-role rows before the member's roles
    /// change. If the role edit then fails, only the carried rows are kept.
    async fn apply_staged(&self, entry: &Staged, guild: &GuildConfig) -> ModerationResult<()> {
        let case = &entry.case;
        if let Some(lift) = &entry.lift {
            debug!(
                guild_id = case.guild_id,
                case_number = case.case_number,
                "Lifting the previous mute before switching mute style"
            );
            self.executor
                .apply(Punishment {
                    case,
                    action: lift,
                    mute_role_id: guild.mute_role_id,
                    restored_roles: entry.restored_roles.clone(),
                    planned_roles: None,
                })
                .await?;
        }
        // Lifting gave the carried roles back already
        let carried = if entry.lift.is_some() {
            Vec::new()
        } else {
            entry.restored_roles.clone()
        };

        let planned_roles = match entry.action {
            CaseAction::Mute {
                use_timeouts: false,
                ..
            } => {
                let plan = self
                    .executor
                    .plan_role_mute(case.guild_id, case.target_id, guild.mute_role_id)
                    .await?;
                let rows = merged_roles(&carried, &plan);
                self.store_roles(case, entry.closes, &rows).await?;
                Some(plan)
            }
            _ => None,
        };
        let planned = planned_roles.is_some();

        let result = self
            .executor
            .apply(Punishment {
                case,
                action: &entry.action,
                mute_role_id: guild.mute_role_id,
                restored_roles: carried.clone(),
                planned_roles,
            })
            .await;

        if let Err(e) = result {
            if planned {
                if let Err(store_error) = self.store_roles(case, None, &carried).await {
                    warn!(
                        case_number = case.case_number,
                        error = %store_error,
                        "Failed to drop restored roles of a mute that did not apply"
                    );
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Move or consume the restored-role rows a case did not store up front
    async fn settle_roles(&self, entry: &Staged, applied: bool) -> ModerationResult<()> {
        let case = &entry.case;
        let roles = match case.action {
            // Timeout mutes never hold role rows
            ActionType::Mute if case.use_timeouts => Vec::new(),
            // Stored before the role edit
            ActionType::Mute if applied => return Ok(()),
            ActionType::Mute => entry.restored_roles.clone(),
            ActionType::Unmute => Vec::new(),
            _ => return Ok(()),
        };
        if roles.is_empty() && entry.closes.is_none() {
            return Ok(());
        }
        self.store_roles(case, entry.closes, &roles).await
    }

    /// Replace a case's restored-role rows, consuming those of the case it closes
    async fn store_roles(&self, case: &Case, closes: Option<Uuid>, roles: &[u64]) -> ModerationResult<()> {
        let mut tx = self.store.begin(case.guild_id).await?;
        if let Some(prior) = closes {
            tx.delete_restored_roles(prior).await?;
        }
        tx.delete_restored_roles(case.id).await?;
        let rows: Vec<RestoredRole> = roles
            .iter()
            .map(|&role_id| RestoredRole {
                case_id: case.id,
                role_id,
            })
            .collect();
        tx.insert_restored_roles(&rows).await?;
        tx.commit().await
    }

    async fn lock(&self, case: &Case) {
        let key = LockKey::new(case.action, case.target_id, case.guild_id).to_string();
        let ttl = self.settings.engine.lock_ttl();
        if let Err(e) = self
            .locks
            .set_with_ttl(&key, &case.id.to_string(), ttl)
            .await
        {
            warn!(key = %key, error = %e, "Failed to write action lock");
        }
    }

    /// The case behind a live lock on (action, target, guild)
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails while loading the case. A failing
    /// lock service reads as "not locked".
    pub async fn is_locked(
        &self,
        action: ActionType,
        target_id: u64,
        guild_id: u64,
    ) -> ModerationResult<Option<Case>> {
        let key = LockKey::new(action, target_id, guild_id).to_string();
        let value = match self.locks.get(&key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read action lock");
                return Ok(None);
            }
        };

        let Some(case_id) = value.and_then(|v| Uuid::parse_str(&v).ok()) else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_case_by_id(case_id)
            .await?
            .filter(|case| case.guild_id == guild_id))
    }

    /// Reverse an expired mute or ban.
    ///
    /// Records the matching unmute/unban (restoring recorded roles for role
    /// mutes) and applies it. Only once Discord accepted it is the original
    /// marked processed and its task dropped. When the original was already
    /// reversed, only the task is dropped and the original is returned.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for actions that cannot be reversed. On any other
    /// error the original stays open with its task, so the next run retries.
    /// A retry reuses the reversal case recorded by the failed attempt.
    pub async fn undo_timed_action(&self, case: &Case, reason: Option<String>) -> ModerationResult<Case> {
        let action = match case.action.reversal() {
            Some(ActionType::Unmute) => CaseAction::Unmute {
                use_timeouts: case.use_timeouts,
            },
            Some(_) => CaseAction::Unban,
            None => {
                return Err(ModerationError::Validation(format!(
                    "{} cases cannot be reversed",
                    case.action
                )));
            }
        };

        let current = self
            .store
            .find_case_by_id(case.id)
            .await?
            .ok_or_else(|| ModerationError::NotFound(format!("case #{}", case.case_number)))?;
        if current.processed {
            info!(
                guild_id = current.guild_id,
                case_number = current.case_number,
                "Case already reversed, dropping its task"
            );
            self.close_timed_case(&current).await?;
            return Ok(current);
        }

        let guild = self.settings.guild(current.guild_id);
        let deadline = self.settings.engine.transaction_timeout();
        let (reversal, recorded) =
            tokio::time::timeout(deadline, self.record_reversal(&current, action, reason))
                .await
                .map_err(|_| ModerationError::Timeout(deadline))??;

        if recorded {
            self.notify(&reversal.case, &guild).await;
        }
        let result = self
            .executor
            .apply(Punishment {
                case: &reversal.case,
                action: &reversal.action,
                mute_role_id: guild.mute_role_id,
                restored_roles: reversal.restored_roles.clone(),
                planned_roles: None,
            })
            .await;
        if recorded {
            self.lock(&reversal.case).await;
            self.publisher
                .publish(CASE_FINALIZED, vec![reversal.case.clone()]);
        }

        if let Err(e) = result {
            error!(
                guild_id = current.guild_id,
                case_number = current.case_number,
                reversal_number = reversal.case.case_number,
                error = %e,
                "Reversal failed on Discord, keeping the task"
            );
            return Err(ModerationError::not_applied(&reversal.case, e));
        }

        self.close_timed_case(&current).await?;
        Ok(reversal.case)
    }

    /// Record the reversal of `original`, or find the one a failed attempt left.
    ///
    /// The flag is false when the case already existed.
    async fn record_reversal(
        &self,
        original: &Case,
        action: CaseAction,
        reason: Option<String>,
    ) -> ModerationResult<(Staged, bool)> {
        let mut tx = self.store.begin(original.guild_id).await?;
        let restored_roles = if original.use_timeouts {
            Vec::new()
        } else {
            tx.find_restored_roles(original.id).await?
        };

        let pending = CaseFilter::target(original.target_id)
            .action(action.get_type())
            .references(original.case_number);
        if let Some(case) = tx.find_case(&pending).await? {
            debug!(
                guild_id = case.guild_id,
                case_number = case.case_number,
                "Retrying a recorded reversal"
            );
            let staged = Staged {
                case,
                action,
                restored_roles,
                closes: None,
                lift: None,
            };
            return Ok((staged, false));
        }

        let mut case = Case::new(
            original.guild_id,
            original.target_id,
            original.target_tag.clone(),
            action.get_type(),
        );
        case.ref_id = Some(original.case_number);
        case.reason = bound_reason(Some(
            reason.unwrap_or_else(|| format!("Case #{} expired", original.case_number)),
        ));
        case.use_timeouts = action.use_timeouts();
        let case = tx.insert_case(case).await?;
        tx.commit().await?;

        info!(
            guild_id = case.guild_id,
            case_number = case.case_number,
            target_id = case.target_id,
            action = %case.action,
            ref_id = original.case_number,
            "Case recorded"
        );
        let staged = Staged {
            case,
            action,
            restored_roles,
            closes: None,
            lift: None,
        };
        Ok((staged, true))
    }

    /// Mark a timed case processed, dropping its task and restored roles
    async fn close_timed_case(&self, case: &Case) -> ModerationResult<()> {
        let mut tx = self.store.begin(case.guild_id).await?;
        tx.update_case(case.id, &CasePatch::processed()).await?;
        tx.delete_reversal(case.id).await?;
        tx.delete_restored_roles(case.id).await?;
        tx.commit().await
    }

    /// Look a case up by number
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the guild has no such case.
    pub async fn find_case(&self, guild_id: u64, case_number: u64) -> ModerationResult<Case> {
        let mut tx = self.store.begin(guild_id).await?;
        find_by_number(tx.as_mut(), case_number).await
    }

    /// Every case of a member, oldest first
    pub async fn target_history(&self, guild_id: u64, target_id: u64) -> ModerationResult<Vec<Case>> {
        let mut tx = self.store.begin(guild_id).await?;
        tx.find_cases(&CaseFilter::target(target_id)).await
    }

    /// Pardon a warn so it stops counting toward escalation
    ///
    /// # Errors
    ///
    /// Returns `Validation` for non-warn or already pardoned cases.
    pub async fn pardon(&self, guild_id: u64, case_number: u64, moderator_id: u64) -> ModerationResult<Case> {
        let mut tx = self.store.begin(guild_id).await?;
        let case = find_by_number(tx.as_mut(), case_number).await?;
        if case.action != ActionType::Warn {
            return Err(ModerationError::Validation(format!(
                "Case #{case_number} is not a warn"
            )));
        }
        if case.pardoned_by.is_some() {
            return Err(ModerationError::Validation(format!(
                "Case #{case_number} is already pardoned"
            )));
        }

        let patch = CasePatch {
            pardoned_by: Some(moderator_id),
            ..Default::default()
        };
        let case = tx.update_case(case.id, &patch).await?;
        tx.commit().await?;
        info!(guild_id, case_number, moderator_id, "Warn pardoned");
        Ok(case)
    }

    pub async fn update_reason(
        &self,
        guild_id: u64,
        case_number: u64,
        reason: Option<String>,
    ) -> ModerationResult<Case> {
        let mut tx = self.store.begin(guild_id).await?;
        let case = find_by_number(tx.as_mut(), case_number).await?;
        let patch = CasePatch {
            reason: Some(bound_reason(reason)),
            ..Default::default()
        };
        let case = tx.update_case(case.id, &patch).await?;
        tx.commit().await?;
        Ok(case)
    }

    /// Change how long an open mute or ban lasts, counted from its creation.
    ///
    /// `None` makes the action permanent, which native timeouts do not allow.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for closed or non-timed cases, and
    /// `ActionNotApplied` if the new timeout could not be set on Discord.
    pub async fn update_duration(
        &self,
        guild_id: u64,
        case_number: u64,
        duration: Option<Duration>,
    ) -> ModerationResult<Case> {
        let duration = duration.filter(|d| *d > Duration::zero());

        let mut tx = self.store.begin(guild_id).await?;
        let case = find_by_number(tx.as_mut(), case_number).await?;
        if !case.action.can_expire() || case.processed {
            return Err(ModerationError::Validation(format!(
                "Case #{case_number} is not an open mute or ban"
            )));
        }
        if case.action == ActionType::Mute && case.use_timeouts {
            validate_action(&CaseAction::mute(duration, true), &self.settings.guild(guild_id))?;
        }

        let expires_at = duration.map(|d| case.created_at + d);
        let patch = CasePatch {
            expires_at: Some(expires_at),
            ..Default::default()
        };
        let case = tx.update_case(case.id, &patch).await?;
        match expires_at {
            Some(run_at) => {
                tx.schedule_reversal(ScheduledReversal {
                    case_id: case.id,
                    guild_id,
                    run_at,
                })
                .await?;
            }
            None => tx.delete_reversal(case.id).await?,
        }
        tx.commit().await?;
        info!(guild_id, case_number, expires_at = ?expires_at, "Case duration updated");

        if case.action == ActionType::Mute && case.use_timeouts {
            let reason = Some(crate::moderation::executor::audit_reason(&case));
            if let Err(e) = self
                .platform
                .set_timeout(guild_id, case.target_id, expires_at, reason)
                .await
            {
                return Err(ModerationError::not_applied(&case, e));
            }
        }
        Ok(case)
    }

    /// Delete a case along with its restored roles and reversal task
    pub async fn delete_case(&self, guild_id: u64, case_number: u64) -> ModerationResult<Case> {
        let mut tx = self.store.begin(guild_id).await?;
        let case = find_by_number(tx.as_mut(), case_number).await?;
        tx.delete_case(case.id).await?;
        tx.commit().await?;
        info!(guild_id, case_number, "Case deleted");
        Ok(case)
    }
}

/// Close the open timed case a new case supersedes, then insert the new one
async fn stage(
    tx: &mut dyn CaseTransaction,
    mut case: Case,
    mut action: CaseAction,
    explicit_roles: Option<Vec<u64>>,
) -> ModerationResult<Staged> {
    let mut restored_roles = explicit_roles.clone().unwrap_or_default();
    let mut closes = None;
    let mut lift = None;

    let kind = action.get_type();
    let timed = if kind.can_expire() {
        Some(kind)
    } else {
        kind.reverses()
    };

    if let Some(kind) = timed {
        let filter = CaseFilter::target(case.target_id).action(kind).unprocessed();
        if let Some(prior) = tx.find_case(&filter).await? {
            tx.update_case(prior.id, &CasePatch::processed()).await?;
            tx.delete_reversal(prior.id).await?;

            if case.action != kind && case.ref_id.is_none() {
                case.ref_id = Some(prior.case_number);
            }
            if let CaseAction::Unmute { use_timeouts } = &mut action {
                *use_timeouts = prior.use_timeouts;
            }
            if kind == ActionType::Mute && !prior.use_timeouts {
                closes = Some(prior.id);
                if explicit_roles.is_none() {
                    restored_roles = tx.find_restored_roles(prior.id).await?;
                }
            }
            if case.action == ActionType::Mute && prior.use_timeouts != action.use_timeouts() {
                lift = Some(CaseAction::Unmute {
                    use_timeouts: prior.use_timeouts,
                });
            }
            debug!(
                guild_id = prior.guild_id,
                case_number = prior.case_number,
                "Open case closed by a newer one"
            );
        }
    }

    case.use_timeouts = action.use_timeouts();
    case.expires_at = action.expires_at(case.created_at);
    let case = tx.insert_case(case).await?;

    if let Some(run_at) = case.expires_at {
        tx.schedule_reversal(ScheduledReversal {
            case_id: case.id,
            guild_id: case.guild_id,
            run_at,
        })
        .await?;
    }

    Ok(Staged {
        case,
        action,
        restored_roles,
        closes,
        lift,
    })
}

/// Carried roles followed by the ones a role mute takes away
fn merged_roles(carried: &[u64], plan: &MuteRoleSet) -> Vec<u64> {
    let mut roles = carried.to_vec();
    for &role_id in &plan.removed {
        if !roles.contains(&role_id) {
            roles.push(role_id);
        }
    }
    roles
}

async fn find_by_number(tx: &mut dyn CaseTransaction, case_number: u64) -> ModerationResult<Case> {
    tx.find_case(&CaseFilter::number(case_number))
        .await?
        .ok_or_else(|| ModerationError::NotFound(format!("case #{case_number}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WarnPunishment;
    use crate::moderation::lock::MockLockService;
    use crate::moderation::testing::{
        FakePlatform, GUILD, Harness, MUTE_ROLE, RecordingNotifier, role_mute_guild,
    };
    use crate::moderation::{BroadcastPublisher, MemoryCaseStore, RoleInfo};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, Ordering};

    const TARGET: u64 = 7;

    fn timeout_guild(rules: Vec<WarnPunishment>) -> GuildConfig {
        GuildConfig {
            name: Some("Rust Lounge".to_string()),
            warn_punishments: rules,
            ..GuildConfig::for_guild(GUILD)
        }
    }

    fn warn(target_id: u64) -> CreateCase {
        CreateCase::new(GUILD, target_id, "user#0007", CaseAction::Warn).moderator(1, "mod#0001")
    }

    async fn restored_rows(h: &Harness, case_id: Uuid) -> Vec<u64> {
        let mut tx = h.store.begin(GUILD).await.unwrap();
        tx.find_restored_roles(case_id).await.unwrap()
    }

    async fn due(h: &Harness, at: DateTime<Utc>) -> Vec<ScheduledReversal> {
        h.store.due_reversals(at).await.unwrap()
    }

    /// Member holding role 11 and the managed role 12
    fn role_platform() -> FakePlatform {
        FakePlatform::new()
            .with_catalog(vec![
                RoleInfo { id: MUTE_ROLE, managed: false },
                RoleInfo { id: 11, managed: false },
                RoleInfo { id: 12, managed: true },
                RoleInfo { id: 13, managed: false },
            ])
            .with_member(GUILD, TARGET, vec![11, 12])
    }

    fn mute(duration: Duration, use_timeouts: bool) -> CreateCase {
        CreateCase::new(
            GUILD,
            TARGET,
            "user#0007",
            CaseAction::mute(duration, use_timeouts),
        )
        .moderator(1, "mod#0001")
    }

    #[test]
    fn test_validate_action() {
        let guild = GuildConfig::for_guild(GUILD);
        assert!(validate_action(&CaseAction::mute(Duration::hours(1), true), &guild).is_ok());
        assert!(matches!(
            validate_action(&CaseAction::mute(None, true), &guild),
            Err(ModerationError::Validation(_))
        ));
        assert!(matches!(
            validate_action(&CaseAction::mute(Duration::days(29), true), &guild),
            Err(ModerationError::Validation(_))
        ));
        assert!(matches!(
            validate_action(&CaseAction::mute(None, false), &guild),
            Err(ModerationError::Validation(_))
        ));
        assert!(validate_action(&CaseAction::mute(None, false), &role_mute_guild()).is_ok());
        assert!(validate_action(&CaseAction::Kick, &guild).is_ok());
    }

    #[tokio::test]
    async fn test_warn_is_numbered_locked_and_published() {
        let mut h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));

        let outcome = h.engine.create(warn(TARGET).reason("  spam  ")).await.unwrap();
        assert_eq!(outcome.case.case_number, 1);
        assert_eq!(outcome.case.reason.as_deref(), Some("spam"));
        assert_eq!(outcome.case.moderator_tag.as_deref(), Some("mod#0001"));
        assert!(outcome.escalated.is_none());

        let locked = h.engine.is_locked(ActionType::Warn, TARGET, GUILD).await.unwrap();
        assert_eq!(locked, Some(outcome.case.clone()));
        assert!(h.engine.is_locked(ActionType::Warn, TARGET, GUILD + 1).await.unwrap().is_none());

        let batch = h.batches.try_recv().unwrap();
        assert_eq!(batch.topic, CASE_FINALIZED);
        assert_eq!(batch.cases, vec![outcome.case]);

        let sent = h.notifier.sent_to(TARGET);
        assert_eq!(sent, vec!["You have been warned in **Rust Lounge**.\nReason: spam"]);
    }

    #[tokio::test]
    async fn test_validation_failure_writes_nothing() {
        let mut h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        let input = CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::mute(None, true));

        let result = h.engine.create(input).await;
        assert!(matches!(result, Err(ModerationError::Validation(_))));
        assert!(h.engine.target_history(GUILD, TARGET).await.unwrap().is_empty());
        assert!(h.batches.try_recv().is_err());
        assert!(h.platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_long_reasons_are_truncated() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        let outcome = h.engine.create(warn(TARGET).reason("x".repeat(600))).await.unwrap();
        assert_eq!(outcome.case.reason.map(|r| r.chars().count()), Some(512));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_get_contiguous_numbers() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));

        let mut handles = Vec::new();
        for target in 0..20u64 {
            let engine = Arc::clone(&h.engine);
            handles.push(tokio::spawn(async move {
                engine.create(warn(100 + target)).await.unwrap().case.case_number
            }));
        }

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_role_mute_and_timed_reversal_restore_roles() {
        let h = Harness::new(role_platform(), role_mute_guild());

        let mute = h.engine.create(mute(Duration::minutes(10), false)).await.unwrap().case;

        assert!(!mute.use_timeouts);
        assert_eq!(mute.expires_at, Some(mute.created_at + Duration::minutes(10)));
        assert_eq!(h.platform.member_roles_now(GUILD, TARGET), vec![MUTE_ROLE, 12]);
        assert_eq!(restored_rows(&h, mute.id).await, vec![11]);
        assert!(due(&h, mute.created_at + Duration::minutes(9)).await.is_empty());
        assert_eq!(due(&h, mute.created_at + Duration::minutes(11)).await.len(), 1);

        // Gained while muted
        h.platform
            .roles
            .lock()
            .unwrap()
            .insert((GUILD, TARGET), vec![MUTE_ROLE, 12, 13]);

        let unmute = h.engine.undo_timed_action(&mute, None).await.unwrap();
        assert_eq!(unmute.action, ActionType::Unmute);
        assert_eq!(unmute.case_number, 2);
        assert_eq!(unmute.ref_id, Some(1));
        assert!(unmute.moderator_id.is_none());
        assert_eq!(h.platform.member_roles_now(GUILD, TARGET), vec![12, 13, 11]);

        let mute = h.engine.find_case(GUILD, 1).await.unwrap();
        assert!(mute.processed);
        assert!(restored_rows(&h, mute.id).await.is_empty());
        assert!(due(&h, mute.created_at + Duration::hours(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_third_warn_escalates_to_timeout_mute() {
        let rules = vec![WarnPunishment {
            warn_count: 3,
            action: ActionType::Mute,
            duration_secs: Some(3600),
        }];
        let mut h = Harness::new(FakePlatform::new(), timeout_guild(rules));

        assert!(h.engine.create(warn(TARGET)).await.unwrap().escalated.is_none());
        assert!(h.engine.create(warn(TARGET)).await.unwrap().escalated.is_none());
        let third = h.engine.create(warn(TARGET)).await.unwrap();

        let mute = third.escalated.unwrap();
        assert_eq!(third.case.case_number, 3);
        assert_eq!(mute.case_number, 4);
        assert_eq!(mute.action, ActionType::Mute);
        assert_eq!(mute.ref_id, Some(3));
        assert!(mute.use_timeouts);
        assert!(mute.moderator_id.is_none());
        assert_eq!(mute.expires_at, Some(mute.created_at + Duration::minutes(60)));
        assert!(h.platform.timeouts.lock().unwrap().contains_key(&(GUILD, TARGET)));

        let locked = h.engine.is_locked(ActionType::Mute, TARGET, GUILD).await.unwrap();
        assert_eq!(locked.map(|c| c.case_number), Some(4));

        let batches: Vec<usize> = std::iter::from_fn(|| h.batches.try_recv().ok())
            .map(|batch| batch.cases.len())
            .collect();
        assert_eq!(batches, vec![1, 1, 2]);

        // No rule for four warns
        assert!(h.engine.create(warn(TARGET)).await.unwrap().escalated.is_none());
    }

    #[tokio::test]
    async fn test_pardoned_warns_do_not_escalate() {
        let rules = vec![WarnPunishment {
            warn_count: 2,
            action: ActionType::Kick,
            duration_secs: None,
        }];
        let h = Harness::new(FakePlatform::new(), timeout_guild(rules));

        h.engine.create(warn(TARGET)).await.unwrap();
        let pardoned = h.engine.pardon(GUILD, 1, 99).await.unwrap();
        assert_eq!(pardoned.pardoned_by, Some(99));

        let second = h.engine.create(warn(TARGET)).await.unwrap();
        assert!(second.escalated.is_none());
        assert!(h.platform.kicked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pardon_rejects_other_actions() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        let kick = CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::Kick);
        h.engine.create(kick).await.unwrap();
        h.engine.create(warn(TARGET)).await.unwrap();

        assert!(matches!(
            h.engine.pardon(GUILD, 1, 99).await,
            Err(ModerationError::Validation(_))
        ));
        h.engine.pardon(GUILD, 2, 99).await.unwrap();
        assert!(matches!(
            h.engine.pardon(GUILD, 2, 99).await,
            Err(ModerationError::Validation(_))
        ));
        assert!(matches!(
            h.engine.pardon(GUILD, 42, 99).await,
            Err(ModerationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_action_keeps_case() {
        let platform = FakePlatform::new();
        *platform.fail_bans.lock().unwrap() = true;
        let mut h = Harness::new(platform, timeout_guild(Vec::new()));

        let input = CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::ban(None, 0));
        let err = h.engine.create(input).await.unwrap_err();

        let case = err.committed_case().cloned().unwrap();
        assert_eq!(case.case_number, 1);
        assert!(matches!(err, ModerationError::ActionNotApplied { .. }));
        assert_eq!(h.engine.find_case(GUILD, 1).await.unwrap(), case);
        assert!(h.engine.is_locked(ActionType::Ban, TARGET, GUILD).await.unwrap().is_some());
        assert_eq!(h.batches.try_recv().unwrap().cases, vec![case]);
    }

    #[tokio::test]
    async fn test_undelivered_notification_is_not_an_error() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        h.notifier.deliver.store(false, Ordering::SeqCst);

        let input = CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::Kick).reason("raid");
        h.engine.create(input).await.unwrap();

        assert_eq!(h.notifier.sent_to(TARGET).len(), 1);
        assert_eq!(*h.platform.kicked.lock().unwrap(), vec![(GUILD, TARGET)]);
    }

    #[tokio::test]
    async fn test_record_only_skips_side_effects() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        let input = CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::ban(None, 0)).record_only();

        let case = h.engine.create(input).await.unwrap().case;
        assert_eq!(case.action, ActionType::Ban);
        assert!(h.platform.calls().is_empty());
        assert!(h.notifier.sent_to(TARGET).is_empty());
        assert!(h.engine.is_locked(ActionType::Ban, TARGET, GUILD).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_locks_expire_after_ttl() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        let input = CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::Kick);
        h.engine.create(input).await.unwrap();

        tokio::time::advance(std::time::Duration::from_secs(299)).await;
        assert!(h.engine.is_locked(ActionType::Kick, TARGET, GUILD).await.unwrap().is_some());

        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        assert!(h.engine.is_locked(ActionType::Kick, TARGET, GUILD).await.unwrap().is_none());
        assert_eq!(h.engine_config().lock_ttl_secs, 300);
    }

    #[tokio::test]
    async fn test_lock_service_failures_are_not_fatal() {
        let mut locks = MockLockService::new();
        locks
            .expect_set_with_ttl()
            .returning(|_, _, _| Err(ModerationError::Other("lock backend down".to_string())));
        locks
            .expect_get()
            .returning(|_| Err(ModerationError::Other("lock backend down".to_string())));

        let engine = CaseEngine::new(
            Arc::new(MemoryCaseStore::new()),
            Arc::new(locks),
            Arc::new(FakePlatform::new()),
            Arc::new(RecordingNotifier::default()),
            Arc::new(BroadcastPublisher::new(4)),
            Arc::new(Settings::default()),
        );

        engine.create(warn(TARGET)).await.unwrap();
        assert!(engine.is_locked(ActionType::Warn, TARGET, GUILD).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_ban_supersedes_open_ban() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        let first = h
            .engine
            .create(CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::ban(Duration::days(1), 0)))
            .await
            .unwrap()
            .case;
        let second = h
            .engine
            .create(CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::ban(Duration::days(7), 0)))
            .await
            .unwrap()
            .case;

        assert!(h.engine.find_case(GUILD, first.case_number).await.unwrap().processed);
        let pending = due(&h, second.created_at + Duration::days(8)).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].case_id, second.id);

        // A manual unban points at the open ban
        let unban = h
            .engine
            .create(CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::Unban))
            .await
            .unwrap()
            .case;
        assert_eq!(unban.ref_id, Some(second.case_number));
        assert!(h.engine.find_case(GUILD, second.case_number).await.unwrap().processed);
        assert!(due(&h, second.created_at + Duration::days(8)).await.is_empty());
    }

    #[tokio::test]
    async fn test_undo_rejects_non_timed_actions() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        let kick = h
            .engine
            .create(CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::Kick))
            .await
            .unwrap()
            .case;

        let result = h.engine.undo_timed_action(&kick, None).await;
        assert!(matches!(result, Err(ModerationError::Validation(_))));
    }

    #[tokio::test]
    async fn test_undo_of_already_reversed_case_only_drops_task() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        let ban = h
            .engine
            .create(CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::ban(Duration::days(1), 0)))
            .await
            .unwrap()
            .case;
        h.engine
            .create(CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::Unban))
            .await
            .unwrap();

        let result = h.engine.undo_timed_action(&ban, None).await.unwrap();
        assert_eq!(result.id, ban.id);
        assert!(result.processed);
        assert_eq!(h.engine.target_history(GUILD, TARGET).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_mute_over_role_mute_gives_roles_back() {
        let h = Harness::new(role_platform(), role_mute_guild());
        let role_mute = h.engine.create(mute(Duration::minutes(10), false)).await.unwrap().case;
        assert_eq!(h.platform.member_roles_now(GUILD, TARGET), vec![MUTE_ROLE, 12]);

        let timeout = h.engine.create(mute(Duration::hours(1), true)).await.unwrap().case;
        assert!(timeout.use_timeouts);
        assert_eq!(h.platform.member_roles_now(GUILD, TARGET), vec![12, 11]);
        assert!(h.platform.timeouts.lock().unwrap().contains_key(&(GUILD, TARGET)));
        assert!(restored_rows(&h, timeout.id).await.is_empty());
        assert!(restored_rows(&h, role_mute.id).await.is_empty());
        assert!(h.engine.find_case(GUILD, role_mute.case_number).await.unwrap().processed);

        h.engine.undo_timed_action(&timeout, None).await.unwrap();
        assert!(h.platform.timeouts.lock().unwrap().is_empty());
        assert_eq!(h.platform.member_roles_now(GUILD, TARGET), vec![12, 11]);
    }

    #[tokio::test]
    async fn test_role_mute_over_timeout_mute_clears_timeout() {
        let h = Harness::new(role_platform(), role_mute_guild());
        h.engine.create(mute(Duration::hours(1), true)).await.unwrap();
        assert!(h.platform.timeouts.lock().unwrap().contains_key(&(GUILD, TARGET)));

        let role_mute = h.engine.create(mute(Duration::minutes(10), false)).await.unwrap().case;
        assert!(h.platform.timeouts.lock().unwrap().is_empty());
        assert_eq!(h.platform.member_roles_now(GUILD, TARGET), vec![MUTE_ROLE, 12]);
        assert_eq!(restored_rows(&h, role_mute.id).await, vec![11]);
    }

    #[tokio::test]
    async fn test_failed_role_edit_stores_no_rows() {
        let platform = role_platform();
        *platform.fail_role_edits.lock().unwrap() = true;
        let h = Harness::new(platform, role_mute_guild());

        let err = h.engine.create(mute(Duration::minutes(10), false)).await.unwrap_err();
        let case = err.committed_case().cloned().unwrap();
        assert_eq!(h.platform.member_roles_now(GUILD, TARGET), vec![11, 12]);
        assert!(restored_rows(&h, case.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_unban_keeps_ban_open_for_retry() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        let ban = h
            .engine
            .create(CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::ban(Duration::hours(1), 0)))
            .await
            .unwrap()
            .case;

        *h.platform.fail_unbans.lock().unwrap() = true;
        let err = h.engine.undo_timed_action(&ban, None).await.unwrap_err();
        assert!(matches!(err, ModerationError::ActionNotApplied { .. }));
        assert_eq!(err.committed_case().map(|c| c.action), Some(ActionType::Unban));
        assert!(!h.engine.find_case(GUILD, ban.case_number).await.unwrap().processed);
        assert_eq!(due(&h, ban.created_at + Duration::hours(2)).await.len(), 1);
        assert!(h.platform.bans.lock().unwrap().contains(&(GUILD, TARGET)));

        *h.platform.fail_unbans.lock().unwrap() = false;
        let unban = h.engine.undo_timed_action(&ban, None).await.unwrap();
        assert_eq!(unban.case_number, 2);
        assert_eq!(unban.ref_id, Some(ban.case_number));
        assert_eq!(h.engine.target_history(GUILD, TARGET).await.unwrap().len(), 2);
        assert!(h.engine.find_case(GUILD, ban.case_number).await.unwrap().processed);
        assert!(due(&h, ban.created_at + Duration::hours(2)).await.is_empty());
        assert!(h.platform.bans.lock().unwrap().is_empty());
    }

    /// Store whose `begin` can be made to fail
    struct FlakyStore {
        inner: Arc<MemoryCaseStore>,
        fail_begin: AtomicBool,
        /// Transactions still allowed before `begin` starts failing
        budget: std::sync::Mutex<Option<usize>>,
    }

    impl FlakyStore {
        fn new(inner: Arc<MemoryCaseStore>) -> Self {
            Self {
                inner,
                fail_begin: AtomicBool::new(false),
                budget: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl CaseStore for FlakyStore {
        async fn begin(&self, guild_id: u64) -> ModerationResult<Box<dyn CaseTransaction>> {
            let exhausted = {
                let mut budget = self.budget.lock().unwrap();
                match budget.as_mut() {
                    Some(0) => true,
                    Some(left) => {
                        *left -= 1;
                        false
                    }
                    None => false,
                }
            };
            if exhausted || self.fail_begin.load(Ordering::SeqCst) {
                return Err(ModerationError::Store("database unavailable".to_string()));
            }
            self.inner.begin(guild_id).await
        }

        async fn find_case_by_id(&self, id: Uuid) -> ModerationResult<Option<Case>> {
            self.inner.find_case_by_id(id).await
        }

        async fn due_reversals(
            &self,
            now: DateTime<Utc>,
        ) -> ModerationResult<Vec<ScheduledReversal>> {
            self.inner.due_reversals(now).await
        }
    }

    #[tokio::test]
    async fn test_failed_undo_keeps_task() {
        let store = Arc::new(MemoryCaseStore::new());
        let flaky = Arc::new(FlakyStore::new(Arc::clone(&store)));
        let h = Harness::build(
            FakePlatform::new(),
            timeout_guild(Vec::new()),
            store,
            flaky.clone(),
        );

        let ban = h
            .engine
            .create(CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::ban(Duration::hours(1), 0)))
            .await
            .unwrap()
            .case;

        flaky.fail_begin.store(true, Ordering::SeqCst);
        let result = h.engine.undo_timed_action(&ban, None).await;
        assert!(matches!(result, Err(ModerationError::Store(_))));

        flaky.fail_begin.store(false, Ordering::SeqCst);
        assert_eq!(due(&h, ban.created_at + Duration::hours(2)).await.len(), 1);
        assert!(!h.engine.find_case(GUILD, 1).await.unwrap().processed);
    }

    #[tokio::test]
    async fn test_role_mute_leaves_roles_alone_when_rows_cannot_be_stored() {
        let store = Arc::new(MemoryCaseStore::new());
        let flaky = Arc::new(FlakyStore::new(Arc::clone(&store)));
        let h = Harness::build(role_platform(), role_mute_guild(), store, flaky.clone());

        // The case transaction goes through, storing the rows does not
        *flaky.budget.lock().unwrap() = Some(1);
        let err = h.engine.create(mute(Duration::minutes(10), false)).await.unwrap_err();
        assert!(matches!(err, ModerationError::ActionNotApplied { .. }));

        *flaky.budget.lock().unwrap() = None;
        assert_eq!(h.platform.member_roles_now(GUILD, TARGET), vec![11, 12]);
        assert!(!h.platform.calls().iter().any(|call| call.starts_with("set_roles")));
        assert_eq!(h.engine.find_case(GUILD, 1).await.unwrap().action, ActionType::Mute);
    }

    #[tokio::test]
    async fn test_update_duration_reschedules() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        let ban = h
            .engine
            .create(CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::ban(Duration::days(1), 0)))
            .await
            .unwrap()
            .case;

        let updated = h.engine.update_duration(GUILD, 1, Some(Duration::days(2))).await.unwrap();
        assert_eq!(updated.expires_at, Some(ban.created_at + Duration::days(2)));
        assert!(due(&h, ban.created_at + Duration::days(1) + Duration::hours(1)).await.is_empty());
        assert_eq!(due(&h, ban.created_at + Duration::days(3)).await.len(), 1);

        let permanent = h.engine.update_duration(GUILD, 1, None).await.unwrap();
        assert!(permanent.expires_at.is_none());
        assert!(due(&h, ban.created_at + Duration::days(3)).await.is_empty());
    }

    #[tokio::test]
    async fn test_update_duration_moves_native_timeout() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        let mute = h
            .engine
            .create(CreateCase::new(GUILD, TARGET, "user#0007", CaseAction::mute(Duration::hours(1), true)))
            .await
            .unwrap()
            .case;

        h.engine.update_duration(GUILD, 1, Some(Duration::hours(5))).await.unwrap();
        let until = h.platform.timeouts.lock().unwrap().get(&(GUILD, TARGET)).copied();
        assert_eq!(until, Some(mute.created_at + Duration::hours(5)));

        assert!(matches!(
            h.engine.update_duration(GUILD, 1, None).await,
            Err(ModerationError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_duration_rejects_closed_cases() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        h.engine.create(warn(TARGET)).await.unwrap();
        assert!(matches!(
            h.engine.update_duration(GUILD, 1, Some(Duration::hours(1))).await,
            Err(ModerationError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_reason_and_delete() {
        let h = Harness::new(FakePlatform::new(), timeout_guild(Vec::new()));
        h.engine.create(warn(TARGET)).await.unwrap();

        let updated = h
            .engine
            .update_reason(GUILD, 1, Some("posting invites".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.reason.as_deref(), Some("posting invites"));

        let deleted = h.engine.delete_case(GUILD, 1).await.unwrap();
        assert_eq!(deleted.id, updated.id);
        assert!(matches!(
            h.engine.find_case(GUILD, 1).await,
            Err(ModerationError::NotFound(_))
        ));
    }
}
