//! Error types shared by the dialogue scheduler, the chat flow and the
//! generation collaborator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix the generation collaborator puts in front of failure text.
pub const ERROR_SENTINEL_PREFIX: &str = "(Error";
/// Prefix used when the provider reports an exhausted quota.
pub const QUOTA_SENTINEL_PREFIX: &str = "(API Quota Exceeded";

/// Returns true when a reply is a failure report rather than dialogue content.
pub fn is_error_sentinel(text: &str) -> bool {
    text.starts_with(ERROR_SENTINEL_PREFIX) || text.starts_with(QUOTA_SENTINEL_PREFIX)
}

/// The user-facing category of a failed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Generation,
    QuotaExceeded,
}

impl FailureKind {
    /// Classifies a sentinel text returned in place of a reply.
    pub fn of_sentinel(text: &str) -> Self {
        if text.starts_with(QUOTA_SENTINEL_PREFIX) {
            FailureKind::QuotaExceeded
        } else {
            FailureKind::Generation
        }
    }
}

/// A failed call to the text-generation service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Rate limit or quota exhaustion reported by the provider.
    #[error("API quota exceeded: {message}")]
    QuotaExceeded { message: String },
    /// The configured model does not exist or cannot be reached.
    #[error("The AI model ({model}) could not be accessed.")]
    ModelUnavailable { model: String },
    /// Any other transport or API failure.
    #[error("{message}")]
    Request { message: String },
}

impl GenerationError {
    /// Maps a provider failure onto the taxonomy.
    ///
    /// `status` is the HTTP status when one is known; `detail` is the
    /// provider's message (or the transport error rendered as text).
    pub fn classify(detail: &str, status: Option<u16>, model: &str) -> Self {
        let lowered = detail.to_lowercase();
        if status == Some(429)
            || detail.contains("RESOURCE_EXHAUSTED")
            || lowered.contains("quota")
            || lowered.contains("rate limit")
        {
            GenerationError::QuotaExceeded {
                message: detail.to_string(),
            }
        } else if lowered.contains("not found") || detail.contains("Invalid model name") {
            GenerationError::ModelUnavailable {
                model: model.to_string(),
            }
        } else {
            GenerationError::Request {
                message: detail.to_string(),
            }
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, GenerationError::QuotaExceeded { .. })
    }

    pub fn kind(&self) -> FailureKind {
        if self.is_quota() {
            FailureKind::QuotaExceeded
        } else {
            FailureKind::Generation
        }
    }

    /// Renders the failure as the sentinel text shown in a playground turn.
    pub fn sentinel_text(&self, speaker: &str) -> String {
        match self {
            GenerationError::QuotaExceeded { message } => format!(
                "{QUOTA_SENTINEL_PREFIX} for {speaker}. Please check your plan and billing details. Interaction stopped. Message: {message})"
            ),
            GenerationError::ModelUnavailable { model } => format!(
                "{ERROR_SENTINEL_PREFIX} as {speaker}: The AI model ({model}) could not be accessed.)"
            ),
            GenerationError::Request { message } => {
                format!("{ERROR_SENTINEL_PREFIX} as {speaker}: {message})")
            }
        }
    }

    /// Renders the failure for single-party flows. `action` completes the
    /// sentence "Cannot ... at this time." in the quota copy.
    pub fn user_copy(&self, action: &str) -> String {
        match self {
            GenerationError::QuotaExceeded { message } => format!(
                "API Quota Exceeded. Please check your plan and billing details. Cannot {action} at this time. ({message})"
            ),
            other => format!("Sorry, an error occurred: {other}"),
        }
    }
}

/// Rejections raised before a dialogue is allowed to start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Personas must be different.")]
    IdenticalParties,
    #[error("Please enter a topic for discussion.")]
    EmptyTopic,
}

/// Errors returned by the lifecycle operations of the dialogue scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("The interaction is not paused.")]
    NotPaused,
    #[error("An interaction is already running.")]
    AlreadyRunning,
    #[error("There is no interaction session.")]
    NoSession,
    /// A new turn limit must leave room for at least one more turn.
    #[error("Max Turns must be greater than the {turn_count} turn(s) already taken.")]
    LimitNotAhead { turn_count: u32 },
}

/// Errors returned by the single-party chat flow before any request is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("Cannot send an empty message.")]
    EmptyMessage,
}

/// Errors returned by a persona probe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("Please enter a test prompt.")]
    EmptyQuery,
    #[error(transparent)]
    Generation(#[from] GenerationError),
}
