//! # Inter-Process Communication (IPC)
//!
//! This crate defines the message-passing primitives the synchronous
//! messaging layer is built on.
//!
//! ## Philosophy
//!
//! - **Asynchronous transport**: A channel only ever sends and delivers
//!   single messages; nothing here blocks
//! - **Correlated**: Every synchronous request carries a [`MessageId`] and its
//!   reply carries the same id with the reply flag set
//! - **Typed payloads**: Payloads are serialized data, decoded at the edge by
//!   a [`ReplyDeserializer`]
//!
//! ## Architecture
//!
//! Messages carry:
//! - Routing information (which endpoint on the channel)
//! - Action to invoke
//! - Flags (synchronous, unblocking, reply error)
//! - Correlation id for request/reply matching
//! - Serialized payload
//!
//! The channel itself is described by two traits: [`Transport`] accepts
//! outbound messages, and [`ChannelListener`] receives inbound messages and
//! link events on the I/O thread.

pub mod channel;
pub mod message;
pub mod typed;

pub use channel::{ChannelId, ChannelListener, Delivery, Transport, TransportError};
pub use message::{MessageEnvelope, MessageFlags, MessageId, MessagePayload, SequenceGen};
pub use typed::{JsonReply, MalformedReply, RawReply, ReplyDeserializer};
