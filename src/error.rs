use crate::access::Capability;
use thiserror::Error;

/// Everything that can go wrong while sending a chat turn.
///
/// Every variant is caught at the engine boundary and turned into a
/// user-facing notice; none of them leave the engine in a busy state.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("A response is already being generated")]
    Busy,

    #[error("AI access is disabled for {0}")]
    AccessDenied(Capability),

    #[error("Guest message limit reached")]
    GuestLimitReached,

    #[error("Model proxy rate limit reached")]
    RateLimited,

    #[error("Model proxy credits exhausted")]
    CreditsExhausted,

    #[error("Model proxy request failed with status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Model proxy returned no response body")]
    MissingBody,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Error reading response stream: {0}")]
    Stream(String),

    #[error("Storage error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

impl ChatError {
    /// Whether resending the same message later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::RateLimited
                | ChatError::Network(_)
                | ChatError::Stream(_)
                | ChatError::Http { .. }
                | ChatError::MissingBody
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            ChatError::EmptyMessage => "Type a message or attach a file first.".to_string(),
            ChatError::Busy => "Please wait for the current answer to finish.".to_string(),
            ChatError::AccessDenied(capability) => {
                format!("AI {} is currently unavailable for your account.", capability)
            }
            ChatError::GuestLimitReached => {
                "You have used all guest messages. Sign in to keep chatting.".to_string()
            }
            ChatError::RateLimited => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            ChatError::CreditsExhausted => {
                "AI credits are exhausted. Please contact an administrator.".to_string()
            }
            ChatError::Persistence(_) => "Your chat could not be saved.".to_string(),
            _ => "Something went wrong while getting an answer. Please try again.".to_string(),
        }
    }
}
