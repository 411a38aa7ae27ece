//! # Synchronous IPC
//!
//! Blocking request/reply calls layered over an asynchronous channel.
//!
//! ## Philosophy
//!
//! - **Replies by id, never by position**: every call is matched to its reply
//!   through its [`ipc::MessageId`], whatever the nesting depth
//! - **Blocked, not deaf**: a thread waiting for a reply still services
//!   requests from its peer, so calls in both directions nest
//! - **One terminal state**: a call ends replied, timed out or canceled,
//!   exactly once, and late replies are discarded
//! - **Explicit lifetimes**: queues are per listener thread and die with the
//!   last channel that uses them
//!
//! ## Architecture
//!
//! - [`event`]: manual-reset events and multi-event waits
//! - [`pending`]: outstanding calls of a channel
//! - [`reentrant`]: per-thread queue of messages to run while blocked
//! - [`channel`]: the [`SyncChannel`] facade and the blocking call loop
//! - [`config`]: serde-loadable channel settings

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod pending;
pub mod reentrant;

pub use channel::{MessageHandler, SyncChannel};
pub use config::SyncChannelConfig;
pub use error::{CancelReason, ConfigError, SyncError};
pub use event::{wait_any, wait_any_until, WaitableEvent, WatchKey};
pub use pending::{CallSlot, CallStatus, Outcome, PendingCallTable, Resolution};
pub use reentrant::{DispatchTarget, QueueRegistry, QueuedMessage, ReentrantDispatchQueue};
