//! Error types for the moderation case engine

use crate::moderation::Case;
use thiserror::Error;

/// Errors that can occur during moderation operations
#[derive(Debug, Error)]
pub enum ModerationError {
    /// Bad input, rejected before anything is written
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Case, rule or member not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Discord API error
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<serenity::Error>),

    /// The case was committed but applying it on Discord failed
    #[error("Case #{} recorded but the action may not have applied: {source}", .case.case_number)]
    ActionNotApplied {
        case: Box<Case>,
        source: Box<ModerationError>,
    },

    /// Case store failure
    #[error("Store error: {0}")]
    Store(String),

    /// A store transaction exceeded its deadline
    #[error("Transaction timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Generic error
    #[error("Moderation error: {0}")]
    Other(String),
}

impl From<serenity::Error> for ModerationError {
    fn from(error: serenity::Error) -> Self {
        Self::DiscordApi(Box::new(error))
    }
}

/// Convert a string into a `ModerationError`
impl From<String> for ModerationError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

impl ModerationError {
    /// The committed case behind a partial success, if any
    #[must_use]
    pub fn committed_case(&self) -> Option<&Case> {
        match self {
            Self::ActionNotApplied { case, .. } => Some(case),
            _ => None,
        }
    }

    /// Wrap a platform failure for a case that is already stored
    pub(crate) fn not_applied(case: &Case, source: Self) -> Self {
        Self::ActionNotApplied {
            case: Box::new(case.clone()),
            source: Box::new(source),
        }
    }
}

/// Result type for moderation operations
pub type ModerationResult<T> = Result<T, ModerationError>;
