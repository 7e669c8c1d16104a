//! Case store
//!
//! Durable record of cases, restored-role rows and scheduled reversals.
//! All writes go through a guild-scoped `CaseTransaction`, which is the only
//! place case numbers are allocated. A store loaded from a snapshot file
//! rewrites that file after every commit.

use crate::moderation::{
    Case, CaseFilter, CasePatch, ModerationError, ModerationResult, RestoredRole,
    ScheduledReversal,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Storage backend for cases
#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Open a transaction over one guild's cases.
    ///
    /// Transactions on the same guild are serialized; nothing written through
    /// the transaction is visible to others until `commit`.
    async fn begin(&self, guild_id: u64) -> ModerationResult<Box<dyn CaseTransaction>>;

    /// Look a case up by its surrogate key
    async fn find_case_by_id(&self, id: Uuid) -> ModerationResult<Option<Case>>;

    /// Scheduled reversals whose run time has passed
    async fn due_reversals(&self, now: DateTime<Utc>) -> ModerationResult<Vec<ScheduledReversal>>;
}

/// A unit of work over one guild's cases
#[async_trait]
pub trait CaseTransaction: Send {
    /// The number the next inserted case will receive
    async fn next_case_number(&mut self) -> ModerationResult<u64>;

    /// Number and insert a case, returning the stored row
    async fn insert_case(&mut self, case: Case) -> ModerationResult<Case>;

    /// Most recent case matching the filter
    async fn find_case(&mut self, filter: &CaseFilter) -> ModerationResult<Option<Case>>;

    /// All matching cases, oldest first
    async fn find_cases(&mut self, filter: &CaseFilter) -> ModerationResult<Vec<Case>>;

    async fn update_case(&mut self, id: Uuid, patch: &CasePatch) -> ModerationResult<Case>;

    async fn delete_case(&mut self, id: Uuid) -> ModerationResult<()>;

    async fn insert_restored_roles(&mut self, roles: &[RestoredRole]) -> ModerationResult<()>;

    async fn find_restored_roles(&mut self, case_id: Uuid) -> ModerationResult<Vec<u64>>;

    async fn delete_restored_roles(&mut self, case_id: Uuid) -> ModerationResult<()>;

    /// Insert or replace the reversal task of a case
    async fn schedule_reversal(&mut self, task: ScheduledReversal) -> ModerationResult<()>;

    async fn delete_reversal(&mut self, case_id: Uuid) -> ModerationResult<()>;

    /// Make every write visible atomically
    async fn commit(self: Box<Self>) -> ModerationResult<()>;
}

/// Everything stored for one guild
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GuildLedger {
    guild_id: u64,
    /// Ordered by case number
    cases: Vec<Case>,
    restored_roles: Vec<RestoredRole>,
    reversals: Vec<ScheduledReversal>,
}

impl GuildLedger {
    fn new(guild_id: u64) -> Self {
        Self {
            guild_id,
            ..Default::default()
        }
    }

    fn case_mut(&mut self, id: Uuid) -> ModerationResult<&mut Case> {
        self.cases
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ModerationError::NotFound(format!("case {id}")))
    }
}

/// Snapshot file a store writes through to
#[derive(Debug)]
struct Snapshot {
    path: PathBuf,
    /// Serializes writers so the newest state lands last
    write_lock: Mutex<()>,
    /// Set when the file on disk could not be parsed
    unreadable: AtomicBool,
}

/// In-memory case store with YAML snapshots
#[derive(Clone, Default)]
pub struct MemoryCaseStore {
    ledgers: Arc<DashMap<u64, Arc<Mutex<GuildLedger>>>>,
    /// case id -> guild id
    index: Arc<DashMap<Uuid, u64>>,
    snapshot: Option<Arc<Snapshot>>,
}

impl MemoryCaseStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self, guild_id: u64) -> Arc<Mutex<GuildLedger>> {
        self.ledgers
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(GuildLedger::new(guild_id))))
            .clone()
    }

    fn ledgers(&self) -> Vec<Arc<Mutex<GuildLedger>>> {
        self.ledgers.iter().map(|e| e.value().clone()).collect()
    }

    /// Load a snapshot and keep writing to it after every commit.
    ///
    /// A missing file yields an empty store. An unparsable file also yields
    /// an empty store, but is never overwritten.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut store = Self::new();
        let mut unreadable = false;

        match tokio::fs::read_to_string(path).await {
            Ok(file_content) => match serde_yaml::from_str::<Vec<GuildLedger>>(&file_content) {
                Ok(ledgers) => {
                    for ledger in ledgers {
                        for case in &ledger.cases {
                            store.index.insert(case.id, ledger.guild_id);
                        }
                        store
                            .ledgers
                            .insert(ledger.guild_id, Arc::new(Mutex::new(ledger)));
                    }
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Unreadable case snapshot, starting empty and leaving the file alone"
                    );
                    unreadable = true;
                }
            },
            Err(_) => info!(path = %path.display(), "No case snapshot, starting empty"),
        }

        store.snapshot = Some(Arc::new(Snapshot {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
            unreadable: AtomicBool::new(unreadable),
        }));
        info!(
            guilds = store.ledgers.len(),
            cases = store.index.len(),
            "Case store loaded"
        );
        store
    }

    /// Write a snapshot of every guild's cases
    ///
    /// The file is replaced atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be serialized or written, or
    /// if `path` is the unreadable snapshot this store was loaded from.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let path = path.as_ref();
        let _writer = match &self.snapshot {
            Some(snapshot) if snapshot.path == path => {
                if snapshot.unreadable.load(Ordering::SeqCst) {
                    return Err(format!(
                        "refusing to overwrite unreadable case snapshot {}",
                        path.display()
                    )
                    .into());
                }
                Some(snapshot.write_lock.lock().await)
            }
            _ => None,
        };

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let mut snapshot = Vec::new();
        for ledger in self.ledgers() {
            snapshot.push(ledger.lock().await.clone());
        }
        snapshot.sort_by_key(|l| l.guild_id);

        let yaml = serde_yaml::to_string(&snapshot)?;
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, yaml).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    /// Write through to the snapshot file, if the store has one
    async fn persist(&self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        if let Err(e) = self.save(&snapshot.path).await {
            error!(path = %snapshot.path.display(), error = %e, "Failed to write case snapshot");
        }
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn begin(&self, guild_id: u64) -> ModerationResult<Box<dyn CaseTransaction>> {
        let guard = self.ledger(guild_id).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            store: self.clone(),
        }))
    }

    async fn find_case_by_id(&self, id: Uuid) -> ModerationResult<Option<Case>> {
        let Some(guild_id) = self.index.get(&id).map(|g| *g) else {
            return Ok(None);
        };
        let ledger = self.ledger(guild_id);
        let ledger = ledger.lock().await;
        Ok(ledger.cases.iter().find(|c| c.id == id).cloned())
    }

    async fn due_reversals(&self, now: DateTime<Utc>) -> ModerationResult<Vec<ScheduledReversal>> {
        let mut due = Vec::new();
        for ledger in self.ledgers() {
            let ledger = ledger.lock().await;
            due.extend(ledger.reversals.iter().filter(|t| t.run_at <= now).cloned());
        }
        due.sort_by_key(|t| t.run_at);
        Ok(due)
    }
}

/// Transaction over a working copy of one guild ledger
struct MemoryTransaction {
    guard: OwnedMutexGuard<GuildLedger>,
    working: GuildLedger,
    store: MemoryCaseStore,
}

#[async_trait]
impl CaseTransaction for MemoryTransaction {
    async fn next_case_number(&mut self) -> ModerationResult<u64> {
        let max = self.working.cases.iter().map(|c| c.case_number).max();
        Ok(max.unwrap_or(0) + 1)
    }

    async fn insert_case(&mut self, mut case: Case) -> ModerationResult<Case> {
        if case.guild_id != self.working.guild_id {
            return Err(ModerationError::Store(format!(
                "case for guild {} inserted through guild {}",
                case.guild_id, self.working.guild_id
            )));
        }
        case.case_number = self.next_case_number().await?;
        self.working.cases.push(case.clone());
        debug!(case_id = %case.id, case_number = case.case_number, "Case staged");
        Ok(case)
    }

    async fn find_case(&mut self, filter: &CaseFilter) -> ModerationResult<Option<Case>> {
        Ok(self
            .working
            .cases
            .iter()
            .rev()
            .find(|c| filter.matches(c))
            .cloned())
    }

    async fn find_cases(&mut self, filter: &CaseFilter) -> ModerationResult<Vec<Case>> {
        Ok(self
            .working
            .cases
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    async fn update_case(&mut self, id: Uuid, patch: &CasePatch) -> ModerationResult<Case> {
        let case = self.working.case_mut(id)?;
        patch.apply(case);
        Ok(case.clone())
    }

    async fn delete_case(&mut self, id: Uuid) -> ModerationResult<()> {
        let before = self.working.cases.len();
        self.working.cases.retain(|c| c.id != id);
        if self.working.cases.len() == before {
            return Err(ModerationError::NotFound(format!("case {id}")));
        }
        self.working.restored_roles.retain(|r| r.case_id != id);
        self.working.reversals.retain(|t| t.case_id != id);
        Ok(())
    }

    async fn insert_restored_roles(&mut self, roles: &[RestoredRole]) -> ModerationResult<()> {
        for role in roles {
            if !self.working.restored_roles.contains(role) {
                self.working.restored_roles.push(*role);
            }
        }
        Ok(())
    }

    async fn find_restored_roles(&mut self, case_id: Uuid) -> ModerationResult<Vec<u64>> {
        Ok(self
            .working
            .restored_roles
            .iter()
            .filter(|r| r.case_id == case_id)
            .map(|r| r.role_id)
            .collect())
    }

    async fn delete_restored_roles(&mut self, case_id: Uuid) -> ModerationResult<()> {
        self.working.restored_roles.retain(|r| r.case_id != case_id);
        Ok(())
    }

    async fn schedule_reversal(&mut self, task: ScheduledReversal) -> ModerationResult<()> {
        self.working.reversals.retain(|t| t.case_id != task.case_id);
        self.working.reversals.push(task);
        Ok(())
    }

    async fn delete_reversal(&mut self, case_id: Uuid) -> ModerationResult<()> {
        self.working.reversals.retain(|t| t.case_id != case_id);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> ModerationResult<()> {
        let Self {
            mut guard,
            working,
            store,
        } = *self;

        store.index.retain(|id, guild| {
            *guild != working.guild_id || working.cases.iter().any(|c| c.id == *id)
        });
        for case in &working.cases {
            store.index.insert(case.id, working.guild_id);
        }

        *guard = working;
        drop(guard);
        store.persist().await;
        Ok(())
    }
}
