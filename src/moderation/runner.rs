//! Expiry runner
//!
//! Background task that reverses mutes and bans whose time is up. It wakes on
//! a fixed interval and on explicit requests sent over its channel.

use crate::moderation::{CaseEngine, ModerationError, ModerationResult};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Request type for the expiry task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryCheckRequest {
    /// Reverse everything that is due
    CheckAll,
    /// Reverse what is due in one guild
    CheckGuild { guild_id: u64 },
    /// Stop the task
    Shutdown,
}

/// Drives `CaseEngine::undo_timed_action` for due reversals
#[derive(Clone)]
pub struct ExpiryRunner {
    engine: Arc<CaseEngine>,
}

impl ExpiryRunner {
    pub fn new(engine: Arc<CaseEngine>) -> Self {
        Self { engine }
    }

    /// Spawn the expiry task, returning its request channel
    pub fn start(self, check_interval: Duration) -> (Sender<ExpiryCheckRequest>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<ExpiryCheckRequest>(100);
        let handle = tokio::spawn(async move {
            self.expiry_task(rx, check_interval).await;
        });
        (tx, handle)
    }

    /// Reverse every due task, optionally limited to one guild.
    ///
    /// Returns how many cases were reversed. A failing task is logged and
    /// left for the next run, which reuses its recorded reversal case.
    ///
    /// # Errors
    ///
    /// Returns an error only if the due tasks cannot be listed.
    pub async fn run_due(&self, guild_id: Option<u64>) -> ModerationResult<usize> {
        let store = self.engine.store();
        let due = store.due_reversals(Utc::now()).await?;

        let mut reversed = 0;
        for task in due
            .into_iter()
            .filter(|t| guild_id.is_none_or(|g| t.guild_id == g))
        {
            let Some(case) = store.find_case_by_id(task.case_id).await? else {
                warn!(case_id = %task.case_id, "Reversal task without a case, dropping it");
                let mut tx = store.begin(task.guild_id).await?;
                tx.delete_reversal(task.case_id).await?;
                tx.commit().await?;
                continue;
            };

            match self.engine.undo_timed_action(&case, None).await {
                Ok(reversal) => {
                    reversed += 1;
                    debug!(
                        guild_id = case.guild_id,
                        case_number = case.case_number,
                        reversal_number = reversal.case_number,
                        "Timed case reversed"
                    );
                }
                Err(ModerationError::ActionNotApplied { case: reversal, source }) => warn!(
                    guild_id = case.guild_id,
                    case_number = case.case_number,
                    reversal_number = reversal.case_number,
                    error = %source,
                    "Reversal recorded but not applied on Discord, retrying next run"
                ),
                Err(e) => error!(
                    guild_id = case.guild_id,
                    case_number = case.case_number,
                    error = %e,
                    "Failed to reverse timed case, retrying next run"
                ),
            }
        }
        Ok(reversed)
    }

    async fn expiry_task(&self, mut rx: Receiver<ExpiryCheckRequest>, check_interval: Duration) {
        info!("Starting expiry task with {}s interval", check_interval.as_secs());
        let mut interval = tokio::time::interval(check_interval);

        loop {
            tokio::select! {
                request = rx.recv() => {
                    let guild_id = match request {
                        Some(ExpiryCheckRequest::CheckAll) => None,
                        Some(ExpiryCheckRequest::CheckGuild { guild_id }) => Some(guild_id),
                        Some(ExpiryCheckRequest::Shutdown) | None => {
                            info!("Received shutdown request for expiry task");
                            break;
                        }
                    };
                    if let Err(e) = self.run_due(guild_id).await {
                        error!("Error checking due reversals: {e}");
                    }
                },

                _ = interval.tick() => {
                    match self.run_due(None).await {
                        Ok(0) => {}
                        Ok(reversed) => info!(reversed, "Periodic expiry check done"),
                        Err(e) => error!("Error in periodic expiry check: {e}"),
                    }
                }
            }
        }

        info!("Expiry task shut down");
    }
}
