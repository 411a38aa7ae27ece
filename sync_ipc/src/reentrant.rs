//! Reentrant dispatch while a thread is blocked.
//!
//! A thread blocked in a synchronous call must still service requests the
//! peer sends it, otherwise two processes calling each other deadlock. Each
//! listener thread owns one [`ReentrantDispatchQueue`]. The I/O thread parks
//! unblocking messages there and raises the dispatch event; the blocked
//! thread wakes, drains what it is allowed to dispatch and goes back to
//! waiting.
//!
//! Queues are handed out by a [`QueueRegistry`] keyed by thread identity.
//! Channels hold strong references and the registry only weak ones, so a
//! queue lives exactly as long as some channel bound to its thread.

use crate::event::WaitableEvent;
use ipc::{ChannelId, MessageEnvelope};
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// A channel able to run a message that was parked in a queue.
pub trait DispatchTarget: Send + Sync {
    /// Runs `message` through the channel's handler on the current thread.
    fn dispatch_queued(&self, message: MessageEnvelope);
}

/// An inbound message waiting for its listener thread.
pub struct QueuedMessage {
    message: MessageEnvelope,
    channel: ChannelId,
    target: Weak<dyn DispatchTarget>,
}

impl QueuedMessage {
    pub fn message(&self) -> &MessageEnvelope {
        &self.message
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Hands the message to its channel.
    ///
    /// Returns `false` if the channel no longer exists; the message is dropped.
    pub fn dispatch(self) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                target.dispatch_queued(self.message);
                true
            }
            None => {
                debug!(
                    "Dropping queued message for destroyed {}",
                    self.channel
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for QueuedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedMessage")
            .field("message", &self.message)
            .field("channel", &self.channel)
            .finish()
    }
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    blocked_depth: usize,
}

/// Messages waiting for one listener thread, plus its blocking depth.
pub struct ReentrantDispatchQueue {
    thread: ThreadId,
    dispatch_event: WaitableEvent,
    state: Mutex<QueueState>,
}

impl ReentrantDispatchQueue {
    fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            dispatch_event: WaitableEvent::new(),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// The listener thread this queue serves.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Signaled whenever a message is queued for a blocked waiter.
    pub fn dispatch_event(&self) -> &WaitableEvent {
        &self.dispatch_event
    }

    /// Records that one more call on this thread is blocked. Returns the new depth.
    pub fn enter_blocking(&self) -> usize {
        let mut state = self.state.lock();
        state.blocked_depth += 1;
        state.blocked_depth
    }

    /// Records that a blocked call returned.
    ///
    /// When the outermost call returns, every remaining message is handed
    /// back to be dispatched normally. Otherwise the dispatch event is raised
    /// if messages remain, so the enclosing call re-examines the queue.
    pub fn leave_blocking(&self) -> Vec<QueuedMessage> {
        let mut state = self.state.lock();
        state.blocked_depth = state.blocked_depth.saturating_sub(1);
        if state.blocked_depth == 0 {
            self.dispatch_event.reset();
            return state.messages.drain(..).collect();
        }

        let pending = !state.messages.is_empty();
        drop(state);
        if pending {
            self.dispatch_event.signal();
        }
        Vec::new()
    }

    /// Parks `message` for a blocked call on this thread.
    ///
    /// Hands the message back if no call is blocked; it then takes the
    /// normal dispatch path.
    pub fn try_enqueue(
        &self,
        message: MessageEnvelope,
        channel: ChannelId,
        target: Weak<dyn DispatchTarget>,
    ) -> Result<(), MessageEnvelope> {
        {
            let mut state = self.state.lock();
            if state.blocked_depth == 0 {
                return Err(message);
            }
            state.messages.push_back(QueuedMessage {
                message,
                channel,
                target,
            });
        }
        self.dispatch_event.signal();
        Ok(())
    }

    /// Removes the oldest message, restricted to `channel` when given.
    pub fn take_next(&self, channel: Option<ChannelId>) -> Option<QueuedMessage> {
        let mut state = self.state.lock();
        let position = state
            .messages
            .iter()
            .position(|queued| channel.map_or(true, |channel| queued.channel == channel))?;
        state.messages.remove(position)
    }

    /// Drops every message queued for `channel`. Returns how many were dropped.
    pub fn remove_channel(&self, channel: ChannelId) -> usize {
        let mut state = self.state.lock();
        let before = state.messages.len();
        state.messages.retain(|queued| queued.channel != channel);
        before - state.messages.len()
    }

    pub fn blocked_depth(&self) -> usize {
        self.state.lock().blocked_depth
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().messages.is_empty()
    }
}

impl std::fmt::Debug for ReentrantDispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReentrantDispatchQueue")
            .field("thread", &self.thread)
            .field("queued", &state.messages.len())
            .field("blocked_depth", &state.blocked_depth)
            .finish()
    }
}

/// Hands out one queue per listener thread.
#[derive(Default)]
pub struct QueueRegistry {
    queues: Mutex<HashMap<ThreadId, Weak<ReentrantDispatchQueue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the calling thread's queue, creating it on first use.
    pub fn queue_for_current_thread(&self) -> Arc<ReentrantDispatchQueue> {
        self.queue_for(thread::current().id())
    }

    /// Returns the queue for `thread`, creating it on first use.
    pub fn queue_for(&self, thread: ThreadId) -> Arc<ReentrantDispatchQueue> {
        let mut queues = self.queues.lock();
        queues.retain(|_, queue| queue.strong_count() > 0);
        if let Some(queue) = queues.get(&thread).and_then(Weak::upgrade) {
            return queue;
        }

        let queue = Arc::new(ReentrantDispatchQueue::new(thread));
        queues.insert(thread, Arc::downgrade(&queue));
        debug!("Created reentrant dispatch queue for {:?}", thread);
        queue
    }

    /// Number of queues still referenced by a channel.
    pub fn live_queues(&self) -> usize {
        self.queues
            .lock()
            .values()
            .filter(|queue| queue.strong_count() > 0)
            .count()
    }
}
