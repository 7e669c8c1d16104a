//! Moderation case engine
//!
//! Records every moderation action as a numbered case, applies it on Discord,
//! escalates repeated warns and reverses timed mutes and bans.

pub mod action;
pub mod case;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod executor;
pub mod lock;
pub mod notifier;
pub mod platform;
pub mod publisher;
pub mod reconcile;
pub mod runner;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use action::{
    ActionType, CaseAction, DEFAULT_SOFTBAN_DELETE_DAYS, MAX_DELETE_MESSAGE_DAYS,
    format_action_name, humanize_duration,
};
pub use case::{
    Case, CaseFilter, CasePatch, MAX_REASON_LENGTH, RestoredRole, ScheduledReversal, bound_reason,
};
pub use engine::{CaseEngine, CreateCase, CreateOutcome, Moderator, validate_action};
pub use error::{ModerationError, ModerationResult};
pub use lock::{LockKey, LockService, MemoryLockService};
pub use notifier::{DirectMessageNotifier, Notifier};
pub use platform::{AuditEntry, AuditKind, Platform, RoleInfo, SerenityPlatform};
pub use publisher::{BroadcastPublisher, CASE_FINALIZED, CaseBatch, EventPublisher};
pub use reconcile::{PlatformEvent, ReconciliationListener};
pub use runner::{ExpiryCheckRequest, ExpiryRunner};
pub use store::{CaseStore, CaseTransaction, MemoryCaseStore};
