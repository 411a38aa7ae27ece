//! Blocking calls over an asynchronous channel.
//!
//! [`SyncChannel`] wraps a [`Transport`] and adds request/reply calls that
//! block the calling thread. Two threads are involved:
//!
//! - the **listener thread** creates the channel, issues blocking calls and
//!   runs the [`MessageHandler`];
//! - the **I/O thread** owns the transport and feeds inbound traffic to the
//!   listener returned by [`SyncChannel::io_listener`].
//!
//! While a call is blocked the listener thread keeps servicing unblocking
//! requests from the peer through its reentrant dispatch queue, so nested
//! calls in both directions complete.

use crate::config::SyncChannelConfig;
use crate::error::{CancelReason, SyncError};
use crate::event::{deadline_after, wait_any_until, WaitableEvent, WatchKey};
use crate::pending::{CallSlot, Outcome, PendingCallTable, Resolution};
use crate::reentrant::{DispatchTarget, QueueRegistry, ReentrantDispatchQueue};
use ipc::{
    ChannelId, ChannelListener, Delivery, JsonReply, MessageEnvelope, MessagePayload, RawReply,
    ReplyDeserializer, SequenceGen, Transport,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Application logic attached to a channel.
///
/// Runs on the listener thread, including while a blocking call is waiting.
/// The channel is passed in so handlers can reply or issue nested calls.
pub trait MessageHandler: Send + Sync {
    /// Returns `false` if the message was not handled.
    fn on_message_received(&self, channel: &SyncChannel, message: &MessageEnvelope) -> bool;
}

impl<F> MessageHandler for F
where
    F: Fn(&SyncChannel, &MessageEnvelope) -> bool + Send + Sync,
{
    fn on_message_received(&self, channel: &SyncChannel, message: &MessageEnvelope) -> bool {
        self(channel, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Open,
    Errored,
    Closed,
}

pub(crate) struct SyncContext {
    this: Weak<SyncContext>,
    channel_id: ChannelId,
    handler: Arc<dyn MessageHandler>,
    transport: Arc<dyn Transport>,
    pending: PendingCallTable,
    queue: Arc<ReentrantDispatchQueue>,
    shutdown: Arc<WaitableEvent>,
    shutdown_watch: Option<WatchKey>,
    sequence: SequenceGen,
    restrict_dispatch: AtomicBool,
    allow_no_timeout: AtomicBool,
    default_timeout: Option<Duration>,
    link: Mutex<LinkState>,
    stale_replies: AtomicU64,
}

impl SyncContext {
    fn send_blocking<D: ReplyDeserializer>(
        self: &Arc<Self>,
        mut message: MessageEnvelope,
        timeout: Option<Duration>,
        deserializer: &D,
    ) -> Result<D::Output, SyncError> {
        if message.id.is_some() {
            return Err(SyncError::InvalidRequest(
                "message already carries an id".to_string(),
            ));
        }
        if thread::current().id() != self.queue.thread() {
            return Err(SyncError::InvalidRequest(
                "blocking calls must be made on the listener thread".to_string(),
            ));
        }
        if timeout.is_none() && !self.allow_no_timeout.load(Ordering::Acquire) {
            return Err(SyncError::NoTimeoutDisallowed);
        }
        if self.shutdown.is_signaled() {
            return Err(SyncError::ShutdownInProgress);
        }
        self.check_link()?;

        let id = self.sequence.next_id(message.routing);
        message.id = Some(id);
        message.flags.sync = true;
        message.flags.unblock = true;
        let deadline = deadline_after(timeout);

        let (slot, done) = self.pending.push(id)?;
        // A failure that raced the check above either shows here or cancels the slot.
        if let Err(err) = self.check_link() {
            self.pending.settle(slot, None);
            return Err(err);
        }
        self.queue.enter_blocking();
        debug!("Issued sync call {} on {}", id, self.channel_id);

        if let Err(err) = self.transport.send_async(message) {
            error!("Failed to send sync call {} on {}: {}", id, self.channel_id, err);
            self.pending
                .settle(slot, Some(Outcome::Canceled(CancelReason::ChannelError)));
            self.finish_blocking();
            return Err(SyncError::SendFailed(err.to_string()));
        }

        let outcome = self.wait_for_reply(slot, &done, deadline);
        self.finish_blocking();

        match outcome {
            Outcome::Replied(reply) => {
                debug!("Sync call {} replied", id);
                if reply.is_reply_error() {
                    warn!("Peer rejected sync call {} ({})", id, reply.action);
                    return Err(SyncError::ReplyRejected);
                }
                deserializer.deserialize_reply(&reply.payload).map_err(|err| {
                    warn!("Sync call {}: {}", id, err);
                    SyncError::MalformedReply(err.reason)
                })
            }
            Outcome::TimedOut => {
                warn!(
                    "Sync call {} on {} timed out after {:?}",
                    id, self.channel_id, timeout
                );
                Err(SyncError::Timeout)
            }
            Outcome::Canceled(reason) => {
                info!("Sync call {} canceled: {:?}", id, reason);
                Err(reason.into())
            }
        }
    }

    /// Blocks until the call completes, servicing reentrant messages meanwhile.
    fn wait_for_reply(
        &self,
        slot: CallSlot,
        done: &WaitableEvent,
        deadline: Option<Instant>,
    ) -> Outcome {
        loop {
            let events = [done, self.shutdown.as_ref(), self.queue.dispatch_event()];
            match wait_any_until(&events, deadline) {
                Some(0) => return self.pending.settle(slot, None),
                Some(1) => {
                    return self
                        .pending
                        .settle(slot, Some(Outcome::Canceled(CancelReason::Shutdown)))
                }
                Some(_) => self.dispatch_reentrant(),
                None => return self.pending.settle(slot, Some(Outcome::TimedOut)),
            }
        }
    }

    fn dispatch_reentrant(&self) {
        self.queue.dispatch_event().reset();
        let filter = self
            .restrict_dispatch
            .load(Ordering::Acquire)
            .then_some(self.channel_id);
        while let Some(queued) = self.queue.take_next(filter) {
            debug!(
                "Reentrant dispatch of {} on {} (depth {})",
                queued.message().action,
                queued.channel(),
                self.queue.blocked_depth()
            );
            queued.dispatch();
        }
    }

    fn finish_blocking(&self) {
        for queued in self.queue.leave_blocking() {
            queued.dispatch();
        }
    }

    fn check_link(&self) -> Result<(), SyncError> {
        match *self.link.lock() {
            LinkState::Errored => Err(SyncError::ChannelError),
            LinkState::Closed => Err(SyncError::ChannelClosed),
            LinkState::Connecting | LinkState::Open => Ok(()),
        }
    }

    fn fail_link(&self, state: LinkState, reason: CancelReason) {
        {
            let mut link = self.link.lock();
            if matches!(*link, LinkState::Connecting | LinkState::Open) {
                info!("{} is now {:?}", self.channel_id, state);
                *link = state;
            }
        }
        self.cancel_pending_sends(reason);
    }

    fn cancel_pending_sends(&self, reason: CancelReason) {
        self.pending.cancel_all(reason);
    }

    fn try_resolve_as_reply(&self, message: MessageEnvelope) -> bool {
        match self.pending.try_resolve(message) {
            Resolution::Resolved => true,
            Resolution::Stale(reply) => {
                self.stale_replies.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Discarding stale reply {:?} on {}",
                    reply.id, self.channel_id
                );
                false
            }
        }
    }

    fn enqueue_for_reentrant_dispatch(
        &self,
        message: MessageEnvelope,
    ) -> Result<(), MessageEnvelope> {
        let target: Weak<dyn DispatchTarget> = self.this.clone();
        self.queue.try_enqueue(message, self.channel_id, target)?;
        debug!("Queued message for reentrant dispatch on {}", self.channel_id);
        Ok(())
    }

    fn on_message_received(&self, message: MessageEnvelope) -> Delivery {
        if message.is_reply() {
            self.try_resolve_as_reply(message);
            return Delivery::Consumed;
        }
        if message.should_unblock() {
            return match self.enqueue_for_reentrant_dispatch(message) {
                Ok(()) => Delivery::Consumed,
                Err(message) => Delivery::Forward(message),
            };
        }
        Delivery::Forward(message)
    }

    fn dispatch(self: &Arc<Self>, message: &MessageEnvelope) {
        if message.is_reply() {
            self.try_resolve_as_reply(message.clone());
            return;
        }

        let channel = SyncChannel {
            context: Arc::clone(self),
        };
        if self.handler.on_message_received(&channel, message) || !message.is_sync() {
            return;
        }

        warn!(
            "Unhandled sync message {} on {}, rejecting",
            message.action, self.channel_id
        );
        if let Some(reply) = MessageEnvelope::error_reply_to(message) {
            if let Err(err) = self.transport.send_async(reply) {
                error!("Failed to reject {} on {}: {}", message.action, self.channel_id, err);
            }
        }
    }
}

impl DispatchTarget for SyncContext {
    fn dispatch_queued(&self, message: MessageEnvelope) {
        if let Some(context) = self.this.upgrade() {
            context.dispatch(&message);
        }
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        if let Some(key) = self.shutdown_watch {
            self.shutdown.unwatch(key);
        }
        let dropped = self.queue.remove_channel(self.channel_id);
        if dropped > 0 {
            debug!(
                "Dropped {} queued message(s) for destroyed {}",
                dropped, self.channel_id
            );
        }
    }
}

/// Inbound side handed to the transport.
///
/// Holds the channel weakly so a transport never keeps it alive.
struct IoListener {
    context: Weak<SyncContext>,
}

impl ChannelListener for IoListener {
    fn on_message_received(&self, message: MessageEnvelope) -> Delivery {
        match self.context.upgrade() {
            Some(context) => context.on_message_received(message),
            None => Delivery::Forward(message),
        }
    }

    fn on_channel_opened(&self) {
        if let Some(context) = self.context.upgrade() {
            let mut link = context.link.lock();
            if *link == LinkState::Connecting {
                info!("{} is now open", context.channel_id);
                *link = LinkState::Open;
            }
        }
    }

    fn on_channel_error(&self) {
        if let Some(context) = self.context.upgrade() {
            context.fail_link(LinkState::Errored, CancelReason::ChannelError);
        }
    }

    fn on_channel_closed(&self) {
        if let Some(context) = self.context.upgrade() {
            context.fail_link(LinkState::Closed, CancelReason::ChannelClosed);
        }
    }
}

/// A channel supporting blocking request/reply calls.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct SyncChannel {
    context: Arc<SyncContext>,
}

impl SyncChannel {
    /// Creates a channel bound to the calling thread as its listener thread.
    ///
    /// Setting `shutdown` cancels every outstanding call on the channel.
    pub fn new(
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        registry: &QueueRegistry,
        shutdown: Arc<WaitableEvent>,
    ) -> Self {
        Self::with_config(
            transport,
            handler,
            registry,
            shutdown,
            SyncChannelConfig::default(),
        )
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        registry: &QueueRegistry,
        shutdown: Arc<WaitableEvent>,
        config: SyncChannelConfig,
    ) -> Self {
        let queue = registry.queue_for_current_thread();
        let context = Arc::new_cyclic(|this: &Weak<SyncContext>| {
            // Nothing is pending yet if the event is already set; calls check it up front.
            let watched = this.clone();
            let shutdown_watch = shutdown.watch(move || {
                if let Some(context) = watched.upgrade() {
                    context.cancel_pending_sends(CancelReason::Shutdown);
                }
            });
            SyncContext {
                this: this.clone(),
                channel_id: ChannelId::new(),
                handler,
                transport,
                pending: PendingCallTable::new(),
                queue,
                shutdown,
                shutdown_watch,
                sequence: SequenceGen::new(),
                restrict_dispatch: AtomicBool::new(config.restrict_dispatch_to_same_channel),
                allow_no_timeout: AtomicBool::new(config.allow_no_timeout_sends),
                default_timeout: config.default_timeout(),
                link: Mutex::new(LinkState::Connecting),
                stale_replies: AtomicU64::new(0),
            }
        });

        debug!("Created {}", context.channel_id);
        Self { context }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.context.channel_id
    }

    /// Sends `message` and blocks until its reply, returning the raw payload.
    ///
    /// `None` waits without a deadline, if the channel allows it. Must be
    /// called on the listener thread.
    pub fn send_blocking(
        &self,
        message: MessageEnvelope,
        timeout: Option<Duration>,
    ) -> Result<MessagePayload, SyncError> {
        self.context.send_blocking(message, timeout, &RawReply)
    }

    /// Like [`SyncChannel::send_blocking`], decoding the reply with `deserializer`.
    pub fn call<D: ReplyDeserializer>(
        &self,
        message: MessageEnvelope,
        timeout: Option<Duration>,
        deserializer: &D,
    ) -> Result<D::Output, SyncError> {
        self.context.send_blocking(message, timeout, deserializer)
    }

    /// Like [`SyncChannel::send_blocking`], decoding a JSON reply into `T`.
    pub fn call_json<T: DeserializeOwned>(
        &self,
        message: MessageEnvelope,
        timeout: Option<Duration>,
    ) -> Result<T, SyncError> {
        self.context
            .send_blocking(message, timeout, &JsonReply::<T>::new())
    }

    /// Blocking send using the configured default timeout.
    pub fn send_sync(&self, message: MessageEnvelope) -> Result<MessagePayload, SyncError> {
        self.send_blocking(message, self.context.default_timeout)
    }

    /// Sends an asynchronous message.
    pub fn send(&self, message: MessageEnvelope) -> Result<(), SyncError> {
        if message.is_sync() {
            return Err(SyncError::InvalidRequest(
                "sync messages must be sent with send_blocking".to_string(),
            ));
        }
        self.context.check_link()?;
        self.context
            .transport
            .send_async(message)
            .map_err(|err| SyncError::SendFailed(err.to_string()))
    }

    /// Answers a synchronous request received by the handler.
    pub fn reply(&self, request: &MessageEnvelope, payload: MessagePayload) -> Result<(), SyncError> {
        let reply = MessageEnvelope::reply_to(request, payload).ok_or_else(|| {
            SyncError::InvalidRequest(format!("{} is not a numbered sync request", request.action))
        })?;
        self.context
            .transport
            .send_async(reply)
            .map_err(|err| SyncError::SendFailed(err.to_string()))
    }

    /// While blocked, dispatch only messages arriving on this channel.
    pub fn set_restrict_dispatch_to_same_channel(&self, restrict: bool) {
        self.context
            .restrict_dispatch
            .store(restrict, Ordering::Release);
    }

    /// Accept or reject blocking calls without a timeout.
    pub fn set_allow_no_timeout_sends(&self, allow: bool) {
        self.context.allow_no_timeout.store(allow, Ordering::Release);
    }

    /// Offers an inbound message as a reply to an outstanding call.
    ///
    /// Returns `false` if no issued call matches; the message is discarded.
    pub fn try_resolve_as_reply(&self, message: &MessageEnvelope) -> bool {
        self.context.try_resolve_as_reply(message.clone())
    }

    /// Parks an inbound message for a blocked call on the listener thread.
    ///
    /// Hands the message back if nothing on that thread is blocked.
    pub fn enqueue_for_reentrant_dispatch(
        &self,
        message: MessageEnvelope,
    ) -> Result<(), MessageEnvelope> {
        self.context.enqueue_for_reentrant_dispatch(message)
    }

    /// Delivers a message to the handler on the listener thread.
    ///
    /// An unhandled synchronous request is answered with an error reply.
    pub fn dispatch(&self, message: &MessageEnvelope) {
        self.context.dispatch(message);
    }

    /// Listener to attach to the transport's I/O thread.
    pub fn io_listener(&self) -> Arc<dyn ChannelListener> {
        Arc::new(IoListener {
            context: Arc::downgrade(&self.context),
        })
    }

    /// Closes the channel, canceling every outstanding call.
    pub fn close(&self) {
        self.context
            .fail_link(LinkState::Closed, CancelReason::ChannelClosed);
    }

    /// Number of calls still registered.
    pub fn pending_calls(&self) -> usize {
        self.context.pending.len()
    }

    /// Number of blocking calls outstanding on the listener thread.
    pub fn blocked_depth(&self) -> usize {
        self.context.queue.blocked_depth()
    }

    /// Number of replies discarded because no call was waiting for them.
    pub fn stale_replies(&self) -> u64 {
        self.context.stale_replies.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncChannel")
            .field("channel_id", &self.context.channel_id)
            .field("link", &*self.context.link.lock())
            .field("pending_calls", &self.context.pending.len())
            .finish()
    }
}
