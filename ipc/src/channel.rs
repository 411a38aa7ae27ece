//! Channel abstraction for message passing
//!
//! A channel is asynchronous: [`Transport::send_async`] queues a message for
//! transmission and returns immediately, and inbound traffic is delivered to
//! a [`ChannelListener`] on the I/O thread that owns the channel.

use crate::MessageEnvelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a communication channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(Uuid);

impl ChannelId {
    /// Creates a new random channel ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.0)
    }
}

/// Error reported by a transport when a message cannot be queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel has been closed
    Closed,
    /// The transport failed for another reason
    Failed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Failed(reason) => write!(f, "transport failed: {}", reason),
        }
    }
}

impl std::error::Error for TransportError {}

/// Outbound half of an asynchronous channel
///
/// Implementations hand the message to the I/O thread and return without
/// waiting for it to be written.
pub trait Transport: Send + Sync {
    /// Queues a message for transmission
    fn send_async(&self, message: MessageEnvelope) -> Result<(), TransportError>;
}

/// What the I/O thread should do with an inbound message after a listener saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The listener took ownership of the message
    Consumed,
    /// The message must continue on the normal dispatch path
    Forward(MessageEnvelope),
}

impl Delivery {
    /// Checks if the listener took the message
    pub fn is_consumed(&self) -> bool {
        matches!(self, Delivery::Consumed)
    }
}

/// Inbound half of an asynchronous channel
///
/// All methods run on the I/O thread. Implementations must not block.
pub trait ChannelListener: Send + Sync {
    /// Called for every inbound message
    fn on_message_received(&self, message: MessageEnvelope) -> Delivery;

    /// Called once the channel is connected
    fn on_channel_opened(&self) {}

    /// Called when the channel fails
    fn on_channel_error(&self) {}

    /// Called when the channel is closed
    fn on_channel_closed(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessagePayload;
    use core_types::RoutingId;

    #[test]
    fn test_channel_id_creation() {
        let id1 = ChannelId::new();
        let id2 = ChannelId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_channel_id_display() {
        let id = ChannelId::new();
        assert!(format!("{}", id).starts_with("Channel("));
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "transport closed");
        assert_eq!(
            TransportError::Failed("broken pipe".to_string()).to_string(),
            "transport failed: broken pipe"
        );
    }

    #[test]
    fn test_delivery_is_consumed() {
        let message = MessageEnvelope::new(RoutingId::new(1), "notify", MessagePayload::empty());
        assert!(Delivery::Consumed.is_consumed());
        assert!(!Delivery::Forward(message).is_consumed());
    }
}
