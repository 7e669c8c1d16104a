//! Short-lived action locks
//!
//! A lock records that an (action, target, guild) tuple was recently actioned.
//! Locks are advisory: the engine writes them, callers read them to decide
//! whether to ask for confirmation. They never block a write.

use crate::moderation::{ActionType, ModerationResult};
use async_trait::async_trait;
use dashmap::DashMap;
use derive_more::Display;
use std::time::Duration;
use tokio::time::Instant;

/// Key of a lock entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{}:{target_id}:{guild_id}", action.key())]
pub struct LockKey {
    pub action: ActionType,
    pub target_id: u64,
    pub guild_id: u64,
}

impl LockKey {
    #[must_use]
    pub fn new(action: ActionType, target_id: u64, guild_id: u64) -> Self {
        Self {
            action,
            target_id,
            guild_id,
        }
    }
}

/// Key-value store with "set with TTL" semantics
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockService: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl`
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ModerationResult<()>;

    /// Get a live value
    async fn get(&self, key: &str) -> ModerationResult<Option<String>>;
}

/// In-process lock service backed by a `DashMap`
#[derive(Debug, Default)]
pub struct MemoryLockService {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryLockService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires)| *expires > now);
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> ModerationResult<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> ModerationResult<Option<String>> {
        let now = Instant::now();
        let live = self.entries.get(key).and_then(|entry| {
            let (value, expires) = entry.value();
            (*expires > now).then(|| value.clone())
        });

        if live.is_none() {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(live)
    }
}
