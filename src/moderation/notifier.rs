//! Direct-message notifications to moderated members
//!
//! Delivery is best effort: closed DMs or a departed member never fail a case.

use crate::moderation::{Case, humanize_duration};
use async_trait::async_trait;
use serenity::all::{CreateMessage, Http, UserId};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// Best-effort direct messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns whether the message was delivered
    async fn send_direct_message(&self, user_id: u64, text: String) -> bool;
}

/// Sends direct messages through serenity
pub struct DirectMessageNotifier {
    http: Arc<Http>,
}

impl DirectMessageNotifier {
    #[must_use]
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Notifier for DirectMessageNotifier {
    async fn send_direct_message(&self, user_id: u64, text: String) -> bool {
        match UserId::new(user_id)
            .direct_message(&*self.http, CreateMessage::new().content(text))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(user_id, error = %e, "Direct message not delivered");
                false
            }
        }
    }
}

/// Text sent to the target of a case
#[must_use]
pub fn notification_text(case: &Case, guild_name: Option<&str>) -> String {
    let mut text = format!("You have been {}", case.action.past_tense());
    if let Some(name) = guild_name {
        let _ = write!(text, " in **{name}**");
    }
    if let Some(expires_at) = case.expires_at {
        let _ = write!(text, " for {}", humanize_duration(expires_at - case.created_at));
    }
    text.push('.');

    if let Some(reason) = &case.reason {
        let _ = write!(text, "\nReason: {reason}");
    }
    text
}
