use std::{ops::Deref, path::PathBuf, sync::Arc};

use crate::config::Settings;
use crate::moderation::{CaseEngine, ExpiryCheckRequest, MemoryCaseStore, ReconciliationListener};
use poise::serenity_prelude as serenity;
use serenity::prelude::TypeMapKey;
use tokio::sync::mpsc::Sender;
use tracing::{error, info};

/// Centralized data structure for the bot
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

// Implement TypeMapKey for Data to allow storing it in Serenity's data map
impl TypeMapKey for Data {
    type Value = Data;
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("settings", &self.settings)
            .field("cases_path", &self.cases_path)
            .field("expiry_tx", &self.expiry_tx)
            .finish_non_exhaustive()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct DataInner {
    // Loaded configuration
    pub settings: Arc<Settings>,
    // Case storage, snapshotted to `cases_path`
    pub store: Arc<MemoryCaseStore>,
    pub engine: Arc<CaseEngine>,
    // Records bans, unbans and kicks done outside the bot
    pub listener: Arc<ReconciliationListener>,
    // Channel to the expiry task
    pub expiry_tx: Sender<ExpiryCheckRequest>,
    pub cases_path: PathBuf,
}

impl Data {
    #[must_use]
    pub fn new(inner: DataInner) -> Self {
        Self(Arc::new(inner))
    }

    /// Ask the expiry task to look at one guild right away
    pub async fn request_expiry_check(&self, guild_id: u64) {
        if let Err(e) = self
            .expiry_tx
            .send(ExpiryCheckRequest::CheckGuild { guild_id })
            .await
        {
            error!("Failed to send expiry check request: {e}");
        }
    }

    /// Save the case snapshot
    /// # Errors
    /// This function will return an error if:
    /// - The data directory cannot be created
    /// - The cases cannot be serialized to YAML
    /// - The YAML data cannot be written to the snapshot file
    pub async fn save(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.store.save(&self.cases_path).await?;
        info!(path = %self.cases_path.display(), "Case snapshot saved");
        Ok(())
    }
}
