//! Synchronous messaging error types

use thiserror::Error;

/// Errors returned to the caller of a blocking send
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No reply arrived before the deadline
    #[error("Sync call timed out")]
    Timeout,

    /// The channel reported an error while the call was outstanding
    #[error("Channel error")]
    ChannelError,

    /// The channel was closed while the call was outstanding
    #[error("Channel closed")]
    ChannelClosed,

    /// The reply payload could not be decoded
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    /// The peer could not handle the request
    #[error("Peer rejected the sync message")]
    ReplyRejected,

    /// Process shutdown canceled the call
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// The channel does not accept calls without a timeout
    #[error("Sync calls without a timeout are not allowed on this channel")]
    NoTimeoutDisallowed,

    /// The request cannot be issued as given
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The transport refused the message
    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

/// Why outstanding calls were canceled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    ChannelError,
    ChannelClosed,
    Shutdown,
}

impl From<CancelReason> for SyncError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::ChannelError => SyncError::ChannelError,
            CancelReason::ChannelClosed => SyncError::ChannelClosed,
            CancelReason::Shutdown => SyncError::ShutdownInProgress,
        }
    }
}

/// Errors loading a channel configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
