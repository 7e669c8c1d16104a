//! Bot configuration
//!
//! Engine tunables and per-guild settings live in one YAML file. A missing
//! or unreadable file falls back to defaults so a fresh bot can start.

use crate::moderation::ActionType;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default configuration file
pub const CONFIG_FILE: &str = "data/bot_config.yaml";
/// Default case snapshot file
pub const CASES_FILE: &str = "data/cases.yaml";
/// Environment variable overriding `CONFIG_FILE`
pub const CONFIG_ENV: &str = "CASE_ENGINE_CONFIG";
/// Environment variable overriding `CASES_FILE`
pub const CASES_ENV: &str = "CASE_ENGINE_CASES";

/// Configuration file path, honoring `CONFIG_ENV`
#[must_use]
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_ENV).map_or_else(|_| PathBuf::from(CONFIG_FILE), PathBuf::from)
}

/// Case snapshot path, honoring `CASES_ENV`
#[must_use]
pub fn cases_path() -> PathBuf {
    std::env::var(CASES_ENV).map_or_else(|_| PathBuf::from(CASES_FILE), PathBuf::from)
}

/// Engine tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an action lock stays live
    pub lock_ttl_secs: u64,
    /// Cases younger than this suppress reconciliation
    pub reconcile_window_secs: u64,
    /// Upper bound for a case-creation transaction
    pub transaction_timeout_secs: u64,
    /// How often the expiry runner looks for due reversals
    pub expiry_poll_interval_secs: u64,
    pub softban_delete_message_days: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 300,
            reconcile_window_secs: 30,
            transaction_timeout_secs: 120,
            expiry_poll_interval_secs: 30,
            softban_delete_message_days: crate::moderation::DEFAULT_SOFTBAN_DELETE_DAYS,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn lock_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lock_ttl_secs)
    }

    #[must_use]
    pub fn reconcile_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.reconcile_window_secs).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn transaction_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.transaction_timeout_secs)
    }

    #[must_use]
    pub fn expiry_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.expiry_poll_interval_secs.max(1))
    }
}

/// Automatic punishment once a member reaches `warn_count` unpardoned warns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarnPunishment {
    pub warn_count: u32,
    pub action: ActionType,
    /// Only meaningful for mutes and bans
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

impl WarnPunishment {
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.duration_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }
}

/// Guild configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildConfig {
    // The ID of the guild
    pub guild_id: u64,
    // Shown in direct messages
    pub name: Option<String>,
    // Role swapped in for role-based mutes
    pub mute_role_id: Option<u64>,
    // Mute through Discord timeouts instead of the mute role
    pub use_timeouts: bool,
    // Message deletion window for bans
    pub ban_delete_message_days: u8,
    pub warn_punishments: Vec<WarnPunishment>,
}

impl Default for GuildConfig {
    fn default() -> Self {
        Self {
            guild_id: 0,
            name: None,
            mute_role_id: None,
            use_timeouts: true,
            ban_delete_message_days: 0,
            warn_punishments: Vec::new(),
        }
    }
}

impl GuildConfig {
    /// Defaults for a guild with no stored configuration
    #[must_use]
    pub fn for_guild(guild_id: u64) -> Self {
        Self {
            guild_id,
            ..Default::default()
        }
    }

    /// The rule for exactly `warn_count` warns; the first one wins on duplicates
    #[must_use]
    pub fn warn_punishment(&self, warn_count: u32) -> Option<&WarnPunishment> {
        self.warn_punishments
            .iter()
            .find(|rule| rule.warn_count == warn_count)
    }
}

/// On-disk configuration layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub engine: EngineConfig,
    pub guilds: Vec<GuildConfig>,
}

/// Loaded configuration shared by the engine and the bot
#[derive(Debug, Default)]
pub struct Settings {
    pub engine: EngineConfig,
    guilds: DashMap<u64, GuildConfig>,
}

impl From<BotConfig> for Settings {
    fn from(config: BotConfig) -> Self {
        let guilds = DashMap::new();
        for guild in config.guilds {
            guilds.insert(guild.guild_id, guild);
        }
        Self {
            engine: config.engine,
            guilds,
        }
    }
}

impl Settings {
    /// Configuration of a guild, or defaults when none is stored
    #[must_use]
    pub fn guild(&self, guild_id: u64) -> GuildConfig {
        self.guilds
            .get(&guild_id)
            .map_or_else(|| GuildConfig::for_guild(guild_id), |entry| entry.value().clone())
    }

    /// Insert or replace a guild's configuration
    pub fn set_guild(&self, config: GuildConfig) {
        self.guilds.insert(config.guild_id, config);
    }

    /// Load settings from a YAML file
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(file_content) => match serde_yaml::from_str::<BotConfig>(&file_content) {
                Ok(config) => {
                    info!(path = %path.display(), guilds = config.guilds.len(), "Configuration loaded");
                    config.into()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Invalid configuration, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "No configuration file, using defaults");
                Self::default()
            }
        }
    }

    /// Save settings to a YAML file
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - The config directory cannot be created
    /// - The configuration cannot be serialized to YAML
    /// - The YAML data cannot be written to the config file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let mut guilds: Vec<GuildConfig> = self
            .guilds
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        guilds.sort_by_key(|g| g.guild_id);

        let config = BotConfig {
            engine: self.engine.clone(),
            guilds,
        };
        tokio::fs::write(path, serde_yaml::to_string(&config)?).await?;
        Ok(())
    }
}
