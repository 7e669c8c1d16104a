//! Test doubles shared by the engine and reconciliation tests

use crate::config::{EngineConfig, GuildConfig, Settings};
use crate::moderation::{
    AuditEntry, AuditKind, BroadcastPublisher, CaseBatch, CaseEngine, CaseStore, LockService,
    MemoryCaseStore, MemoryLockService, ModerationResult, Notifier, Platform, RoleInfo,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::Receiver;

pub const GUILD: u64 = 1_000;
pub const MUTE_ROLE: u64 = 900;
pub const BOT: u64 = 4_242;

/// A guild that lives in memory and records every call
#[derive(Default)]
pub struct FakePlatform {
    pub roles: Mutex<HashMap<(u64, u64), Vec<u64>>>,
    pub catalog: Mutex<Vec<RoleInfo>>,
    pub timeouts: Mutex<HashMap<(u64, u64), DateTime<Utc>>>,
    pub bans: Mutex<HashSet<(u64, u64)>>,
    pub kicked: Mutex<Vec<(u64, u64)>>,
    pub audit: Mutex<Vec<(u64, AuditKind, AuditEntry)>>,
    pub calls: Mutex<Vec<String>>,
    pub audit_readable: Mutex<bool>,
    pub fail_bans: Mutex<bool>,
    pub fail_unbans: Mutex<bool>,
    pub fail_role_edits: Mutex<bool>,
}

impl FakePlatform {
    pub fn new() -> Self {
        let platform = Self::default();
        *platform.audit_readable.lock().unwrap() = true;
        platform
    }

    pub fn with_catalog(self, catalog: Vec<RoleInfo>) -> Self {
        *self.catalog.lock().unwrap() = catalog;
        self
    }

    pub fn with_member(self, guild_id: u64, user_id: u64, roles: Vec<u64>) -> Self {
        self.roles.lock().unwrap().insert((guild_id, user_id), roles);
        self
    }

    pub fn member_roles_now(&self, guild_id: u64, user_id: u64) -> Vec<u64> {
        self.roles
            .lock()
            .unwrap()
            .get(&(guild_id, user_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_audit(&self, guild_id: u64, kind: AuditKind, entry: AuditEntry) {
        self.audit.lock().unwrap().push((guild_id, kind, entry));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn member_roles(&self, guild_id: u64, user_id: u64) -> ModerationResult<Vec<u64>> {
        Ok(self.member_roles_now(guild_id, user_id))
    }

    async fn role_catalog(&self, _guild_id: u64) -> ModerationResult<Vec<RoleInfo>> {
        Ok(self.catalog.lock().unwrap().clone())
    }

    async fn set_member_roles(
        &self,
        guild_id: u64,
        user_id: u64,
        roles: Vec<u64>,
        _reason: Option<String>,
    ) -> ModerationResult<()> {
        if *self.fail_role_edits.lock().unwrap() {
            return Err(serenity::Error::Other("Missing Permissions").into());
        }
        self.record(format!("set_roles {user_id} {roles:?}"));
        self.roles.lock().unwrap().insert((guild_id, user_id), roles);
        Ok(())
    }

    async fn set_timeout(
        &self,
        guild_id: u64,
        user_id: u64,
        until: Option<DateTime<Utc>>,
        _reason: Option<String>,
    ) -> ModerationResult<()> {
        self.record(format!("timeout {user_id} {}", until.is_some()));
        let mut timeouts = self.timeouts.lock().unwrap();
        match until {
            Some(until) => timeouts.insert((guild_id, user_id), until),
            None => timeouts.remove(&(guild_id, user_id)),
        };
        Ok(())
    }

    async fn kick(&self, guild_id: u64, user_id: u64, _reason: Option<String>) -> ModerationResult<()> {
        self.record(format!("kick {user_id}"));
        self.kicked.lock().unwrap().push((guild_id, user_id));
        Ok(())
    }

    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        delete_message_days: u8,
        _reason: Option<String>,
    ) -> ModerationResult<()> {
        if *self.fail_bans.lock().unwrap() {
            return Err(serenity::Error::Other("Missing Permissions").into());
        }
        self.record(format!("ban {user_id} {delete_message_days}"));
        self.bans.lock().unwrap().insert((guild_id, user_id));
        Ok(())
    }

    async fn unban(&self, guild_id: u64, user_id: u64) -> ModerationResult<()> {
        if *self.fail_unbans.lock().unwrap() {
            return Err(serenity::Error::Other("Internal Server Error").into());
        }
        self.record(format!("unban {user_id}"));
        self.bans.lock().unwrap().remove(&(guild_id, user_id));
        Ok(())
    }

    async fn can_view_audit_log(&self, _guild_id: u64) -> ModerationResult<bool> {
        Ok(*self.audit_readable.lock().unwrap())
    }

    async fn latest_audit_entry(
        &self,
        guild_id: u64,
        kind: AuditKind,
        target_id: u64,
    ) -> ModerationResult<Option<AuditEntry>> {
        Ok(self
            .audit
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(g, k, e)| *g == guild_id && *k == kind && e.target_id == Some(target_id))
            .map(|(_, _, e)| e.clone()))
    }
}

/// Notifier that records messages and reports a fixed outcome
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(u64, String)>>,
    pub deliver: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent_to(&self, user_id: u64) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_direct_message(&self, user_id: u64, text: String) -> bool {
        self.sent.lock().unwrap().push((user_id, text));
        self.deliver.load(Ordering::SeqCst)
    }
}

/// A fully wired engine over in-memory collaborators
pub struct Harness {
    pub engine: Arc<CaseEngine>,
    pub store: Arc<MemoryCaseStore>,
    pub locks: Arc<MemoryLockService>,
    pub platform: Arc<FakePlatform>,
    pub notifier: Arc<RecordingNotifier>,
    pub settings: Arc<Settings>,
    pub batches: Receiver<CaseBatch>,
}

impl Harness {
    pub fn new(platform: FakePlatform, guild: GuildConfig) -> Self {
        Self::with_store(platform, guild, Arc::new(MemoryCaseStore::new()))
    }

    pub fn with_store(platform: FakePlatform, guild: GuildConfig, store: Arc<MemoryCaseStore>) -> Self {
        Self::build(platform, guild, store.clone(), store)
    }

    pub fn build(
        platform: FakePlatform,
        guild: GuildConfig,
        store: Arc<MemoryCaseStore>,
        engine_store: Arc<dyn CaseStore>,
    ) -> Self {
        let settings = Arc::new(Settings::default());
        settings.set_guild(guild);

        let locks = Arc::new(MemoryLockService::new());
        let platform = Arc::new(platform);
        let notifier = Arc::new(RecordingNotifier {
            deliver: AtomicBool::new(true),
            ..Default::default()
        });
        let publisher = Arc::new(BroadcastPublisher::new(64));
        let batches = publisher.subscribe();

        let engine = Arc::new(CaseEngine::new(
            engine_store,
            locks.clone() as Arc<dyn LockService>,
            platform.clone() as Arc<dyn Platform>,
            notifier.clone() as Arc<dyn Notifier>,
            publisher,
            settings.clone(),
        ));

        Self {
            engine,
            store,
            locks,
            platform,
            notifier,
            settings,
            batches,
        }
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.settings.engine
    }
}

/// Guild using the mute role instead of timeouts
pub fn role_mute_guild() -> GuildConfig {
    GuildConfig {
        mute_role_id: Some(MUTE_ROLE),
        use_timeouts: false,
        ..GuildConfig::for_guild(GUILD)
    }
}
