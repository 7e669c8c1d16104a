//! Finalized-case broadcasting
//!
//! Once a `create` call has committed, its cases are published as one batch
//! for downstream consumers such as the case log and the dashboard.

use crate::moderation::Case;
use tokio::sync::broadcast::{self, Receiver, Sender, error::RecvError};
use tracing::{info, warn};

/// Topic every finalized batch is published on
pub const CASE_FINALIZED: &str = "case-finalized";

/// A batch of cases produced by one engine call
#[derive(Debug, Clone)]
pub struct CaseBatch {
    pub topic: &'static str,
    pub cases: Vec<Case>,
}

/// Fire-and-forget publisher
#[cfg_attr(test, mockall::automock)]
pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: &'static str, cases: Vec<Case>);
}

/// In-process publisher over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: Sender<CaseBatch>,
}

impl BroadcastPublisher {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to every batch published from now on
    #[must_use]
    pub fn subscribe(&self) -> Receiver<CaseBatch> {
        self.tx.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, topic: &'static str, cases: Vec<Case>) {
        if cases.is_empty() {
            return;
        }
        // No subscribers is not an error for a fire-and-forget publisher
        let _ = self.tx.send(CaseBatch { topic, cases });
    }
}

/// Write every finalized case to the case log until the channel closes
pub async fn log_case_batches(mut rx: Receiver<CaseBatch>) {
    loop {
        match rx.recv().await {
            Ok(batch) => {
                for case in &batch.cases {
                    info!(
                        target: crate::CASE_TARGET,
                        topic = batch.topic,
                        case_id = %case.id,
                        case_number = case.case_number,
                        guild_id = case.guild_id,
                        target_id = case.target_id,
                        action = %case.action,
                        moderator_id = ?case.moderator_id,
                        ref_id = ?case.ref_id,
                        expires_at = ?case.expires_at,
                        reason = case.reason.as_deref().unwrap_or(""),
                        "Case finalized"
                    );
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Case log fell behind, batches dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
