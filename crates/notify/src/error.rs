//! Error types for event delivery.

use thiserror::Error;

/// Errors that can occur when delivering an event to a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Channel is not configured
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rate limited by the receiver
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Receiver answered with a non-success status
    #[error("Receiver returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}
