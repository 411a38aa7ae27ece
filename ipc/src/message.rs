//! Message types and envelope structure

use core_types::RoutingId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

const REPLY_BIT: u64 = 1 << 31;
const SEQUENCE_MASK: u64 = REPLY_BIT - 1;

/// Identifier correlating a synchronous request with its reply
///
/// The routing target, a per-channel sequence number and the reply flag are
/// packed into one `u64`. This layout is the only bit-level contract of the
/// synchronous layer and must not change while a channel is alive:
///
/// ```text
///  63            32 31  30             0
/// +----------------+---+----------------+
/// |  routing id    | R |   sequence     |
/// +----------------+---+----------------+
/// ```
///
/// A reply carries the id of its request with `R` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    /// Largest sequence number that fits in the id
    pub const MAX_SEQUENCE: u32 = SEQUENCE_MASK as u32;

    /// Creates a request id
    ///
    /// Sequence bits above [`MessageId::MAX_SEQUENCE`] are discarded.
    pub const fn new(routing: RoutingId, sequence: u32) -> Self {
        Self(((routing.as_u32() as u64) << 32) | (sequence as u64 & SEQUENCE_MASK))
    }

    /// Rebuilds an id from its packed representation
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the packed representation
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Returns the routing target
    pub const fn routing(self) -> RoutingId {
        RoutingId::new((self.0 >> 32) as u32)
    }

    /// Returns the sequence number
    pub const fn sequence(self) -> u32 {
        (self.0 & SEQUENCE_MASK) as u32
    }

    /// Checks if the reply flag is set
    pub const fn is_reply(self) -> bool {
        self.0 & REPLY_BIT != 0
    }

    /// Returns this id with the reply flag set
    pub const fn as_reply(self) -> Self {
        Self(self.0 | REPLY_BIT)
    }

    /// Returns this id with the reply flag cleared
    pub const fn as_request(self) -> Self {
        Self(self.0 & !REPLY_BIT)
    }

    /// Checks if this id is the reply to `request`
    pub const fn answers(self, request: MessageId) -> bool {
        self.is_reply() && self.as_request().0 == request.as_request().0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg({}#{}", self.routing(), self.sequence())?;
        if self.is_reply() {
            write!(f, " reply")?;
        }
        write!(f, ")")
    }
}

/// Per-channel sequence number allocator
///
/// Numbers increase monotonically from the starting value, wrap back to 1
/// after [`MessageId::MAX_SEQUENCE`] and never yield 0.
#[derive(Debug)]
pub struct SequenceGen {
    next: AtomicU32,
}

impl SequenceGen {
    /// Creates a generator whose first number is 1
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a generator whose first number is `first`
    pub const fn starting_at(first: u32) -> Self {
        let first = if first == 0 || first > MessageId::MAX_SEQUENCE {
            1
        } else {
            first
        };
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Returns the next sequence number
    pub fn next_sequence(&self) -> u32 {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = if current >= MessageId::MAX_SEQUENCE {
                1
            } else {
                current + 1
            };
            match self.next.compare_exchange_weak(
                current,
                following,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// Allocates a fresh request id for `routing`
    pub fn next_id(&self, routing: RoutingId) -> MessageId {
        MessageId::new(routing, self.next_sequence())
    }
}

impl Default for SequenceGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery flags carried by every message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    /// The sender is blocked until a reply arrives
    pub sync: bool,
    /// The receiver may dispatch this message while it is itself blocked
    pub unblock: bool,
    /// The reply reports that the request could not be handled
    pub reply_error: bool,
}

/// Message envelope containing routing and metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Correlation id, assigned when a synchronous request is issued
    pub id: Option<MessageId>,
    /// Destination endpoint on the channel
    pub routing: RoutingId,
    /// Action or method to invoke
    pub action: String,
    /// Delivery flags
    pub flags: MessageFlags,
    /// Serialized payload (type-erased)
    pub payload: MessagePayload,
}

impl MessageEnvelope {
    /// Creates an asynchronous message
    pub fn new(routing: RoutingId, action: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            id: None,
            routing,
            action: action.into(),
            flags: MessageFlags::default(),
            payload,
        }
    }

    /// Creates a synchronous request
    ///
    /// The id is left empty; the sending channel assigns one.
    pub fn sync_request(
        routing: RoutingId,
        action: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        let mut message = Self::new(routing, action, payload);
        message.flags.sync = true;
        message.flags.unblock = true;
        message
    }

    /// Sets the correlation id
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Marks an asynchronous message as dispatchable while the receiver is blocked
    pub fn with_unblock(mut self) -> Self {
        self.flags.unblock = true;
        self
    }

    /// Builds the reply to a synchronous request
    ///
    /// Returns `None` if `request` is not a synchronous request with an id.
    pub fn reply_to(request: &MessageEnvelope, payload: MessagePayload) -> Option<Self> {
        let id = request.id.filter(|id| request.flags.sync && !id.is_reply())?;
        Some(Self {
            id: Some(id.as_reply()),
            routing: request.routing,
            action: request.action.clone(),
            flags: MessageFlags::default(),
            payload,
        })
    }

    /// Builds a reply reporting that `request` could not be handled
    pub fn error_reply_to(request: &MessageEnvelope) -> Option<Self> {
        let mut reply = Self::reply_to(request, MessagePayload::empty())?;
        reply.flags.reply_error = true;
        Some(reply)
    }

    /// Checks if the sender blocks waiting for a reply
    pub fn is_sync(&self) -> bool {
        self.flags.sync
    }

    /// Checks if this is a reply to a synchronous request
    pub fn is_reply(&self) -> bool {
        self.id.is_some_and(MessageId::is_reply)
    }

    /// Checks if this message may be dispatched while the receiver is blocked
    pub fn should_unblock(&self) -> bool {
        self.flags.unblock
    }

    /// Checks if this reply reports a failure to handle the request
    pub fn is_reply_error(&self) -> bool {
        self.flags.reply_error
    }
}

/// Type-erased message payload
///
/// The synchronous layer never looks inside; JSON is used so tests and tools
/// can read payloads directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Serialized data (JSON)
    data: Vec<u8>,
}

impl MessagePayload {
    /// Creates a new payload from serializable data
    pub fn new<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_vec(data)?;
        Ok(Self { data: json })
    }

    /// Creates a payload holding JSON `null`
    pub fn empty() -> Self {
        Self {
            data: b"null".to_vec(),
        }
    }

    /// Wraps already-serialized bytes
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Deserializes the payload into a specific type
    pub fn deserialize<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Returns the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_id_layout() {
        let id = MessageId::new(RoutingId::new(3), 7);
        assert_eq!(id.to_bits(), (3u64 << 32) | 7);
        assert_eq!(id.routing(), RoutingId::new(3));
        assert_eq!(id.sequence(), 7);
        assert!(!id.is_reply());

        let reply = id.as_reply();
        assert_eq!(reply.to_bits(), (3u64 << 32) | (1 << 31) | 7);
        assert!(reply.is_reply());
        assert_eq!(reply.as_request(), id);
        assert_eq!(MessageId::from_bits(reply.to_bits()), reply);
    }

    #[test]
    fn test_message_id_answers() {
        let request = MessageId::new(RoutingId::new(1), 5);
        assert!(request.as_reply().answers(request));
        assert!(!request.answers(request));
        assert!(!MessageId::new(RoutingId::new(1), 6).as_reply().answers(request));
        assert!(!MessageId::new(RoutingId::new(2), 5).as_reply().answers(request));
    }

    #[test]
    fn test_message_id_sequence_is_truncated() {
        let id = MessageId::new(RoutingId::new(0), u32::MAX);
        assert_eq!(id.sequence(), MessageId::MAX_SEQUENCE);
        assert!(!id.is_reply());
    }

    #[test]
    fn test_message_id_display() {
        let id = MessageId::new(RoutingId::new(4), 9);
        assert_eq!(format!("{}", id), "Msg(Route(4)#9)");
        assert_eq!(format!("{}", id.as_reply()), "Msg(Route(4)#9 reply)");
    }

    #[test]
    fn test_sequence_gen_monotonic() {
        let gen = SequenceGen::new();
        assert_eq!(gen.next_sequence(), 1);
        assert_eq!(gen.next_sequence(), 2);
        assert_eq!(gen.next_sequence(), 3);
    }

    #[test]
    fn test_sequence_gen_wraps_without_zero() {
        let gen = SequenceGen::starting_at(MessageId::MAX_SEQUENCE);
        assert_eq!(gen.next_sequence(), MessageId::MAX_SEQUENCE);
        assert_eq!(gen.next_sequence(), 1);
        assert_eq!(SequenceGen::starting_at(0).next_sequence(), 1);
    }

    #[test]
    fn test_sequence_gen_next_id_uses_routing() {
        let gen = SequenceGen::starting_at(7);
        let id = gen.next_id(RoutingId::new(2));
        assert_eq!(id, MessageId::new(RoutingId::new(2), 7));
    }

    #[test]
    fn test_sync_request_flags() {
        let request = MessageEnvelope::sync_request(
            RoutingId::new(1),
            "op",
            MessagePayload::new(&json!({"op": "ping"})).unwrap(),
        );
        assert!(request.is_sync());
        assert!(request.should_unblock());
        assert!(!request.is_reply());
        assert!(request.id.is_none());
    }

    #[test]
    fn test_async_message_flags() {
        let message = MessageEnvelope::new(RoutingId::new(1), "notify", MessagePayload::empty());
        assert!(!message.is_sync());
        assert!(!message.should_unblock());
        assert!(message.with_unblock().should_unblock());
    }

    #[test]
    fn test_reply_to_sync_request() {
        let id = MessageId::new(RoutingId::new(1), 7);
        let request =
            MessageEnvelope::sync_request(RoutingId::new(1), "op", MessagePayload::empty())
                .with_id(id);
        let payload = MessagePayload::new(&json!({"pong": true})).unwrap();

        let reply = MessageEnvelope::reply_to(&request, payload.clone()).unwrap();
        assert!(reply.is_reply());
        assert_eq!(reply.id, Some(id.as_reply()));
        assert_eq!(reply.payload, payload);
        assert!(!reply.is_reply_error());
        assert!(!reply.is_sync());
    }

    #[test]
    fn test_reply_requires_sync_request_with_id() {
        let async_message = MessageEnvelope::new(RoutingId::new(1), "op", MessagePayload::empty())
            .with_id(MessageId::new(RoutingId::new(1), 1));
        assert!(MessageEnvelope::reply_to(&async_message, MessagePayload::empty()).is_none());

        let unnumbered =
            MessageEnvelope::sync_request(RoutingId::new(1), "op", MessagePayload::empty());
        assert!(MessageEnvelope::error_reply_to(&unnumbered).is_none());
    }

    #[test]
    fn test_error_reply() {
        let request =
            MessageEnvelope::sync_request(RoutingId::new(1), "op", MessagePayload::empty())
                .with_id(MessageId::new(RoutingId::new(1), 2));
        let reply = MessageEnvelope::error_reply_to(&request).unwrap();
        assert!(reply.is_reply());
        assert!(reply.is_reply_error());
    }

    #[test]
    fn test_message_payload_serialization() {
        let payload = MessagePayload::new(&json!({"op": "ping"})).unwrap();
        let value: serde_json::Value = payload.deserialize().unwrap();
        assert_eq!(value, json!({"op": "ping"}));
        assert_eq!(MessagePayload::from_bytes(payload.as_bytes().to_vec()), payload);
    }

    #[test]
    fn test_empty_payload_is_null() {
        let value: serde_json::Value = MessagePayload::empty().deserialize().unwrap();
        assert!(value.is_null());
    }
}
