//! Synchronous Messaging Test Utilities
//!
//! Shared helpers for the end-to-end scenarios in `tests/`.
//!
//! ## Test Philosophy
//!
//! - **Real threads**: every party and every I/O thread is an OS thread
//! - **Scripted peers**: the far side of a pipe is a closure on its I/O thread
//!   or a full [`SyncChannel`] running on its own listener thread
//! - **Observable dispatch**: handlers record what they ran and at which
//!   blocking depth

use core_types::RoutingId;
use crossbeam::channel::RecvTimeoutError;
use ipc::{Delivery, MessageEnvelope, MessageId, MessagePayload, SequenceGen, Transport};
use parking_lot::Mutex;
use serde_json::Value;
use sim_transport::{FnListener, SimEndpoint};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use sync_ipc::{MessageHandler, QueueRegistry, SyncChannel, WaitableEvent};

/// Routing target used by every scenario.
pub const ROUTE: RoutingId = RoutingId::new(1);

/// Generous upper bound for calls that are expected to succeed.
pub const LONG: Duration = Duration::from_secs(5);

pub fn sync_request(action: &str, body: Value) -> MessageEnvelope {
    MessageEnvelope::sync_request(ROUTE, action, payload(body))
}

pub fn payload(body: Value) -> MessagePayload {
    MessagePayload::new(&body).expect("JSON values always serialize")
}

pub fn body(message: &MessageEnvelope) -> Value {
    message
        .payload
        .deserialize()
        .expect("test payloads are JSON")
}

/// Creates a channel on the calling thread and attaches it to `endpoint`.
pub fn open_channel(
    endpoint: &SimEndpoint,
    handler: Arc<dyn MessageHandler>,
    registry: &QueueRegistry,
    shutdown: &Arc<WaitableEvent>,
) -> SyncChannel {
    let channel = SyncChannel::new(
        endpoint.transport(),
        handler,
        registry,
        Arc::clone(shutdown),
    );
    endpoint.attach(channel.io_listener());
    channel
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

/// What a [`ScriptedHandler`] saw.
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub action: String,
    pub body: Value,
    /// Blocked calls outstanding on the listener thread at dispatch time
    pub blocked_depth: usize,
}

type Respond = dyn Fn(&SyncChannel, &MessageEnvelope) -> Option<Value> + Send + Sync;

/// Handler that records every message and answers sync requests from a script.
///
/// A script returning `None` leaves a sync request unhandled.
pub struct ScriptedHandler {
    observed: Mutex<Vec<Observed>>,
    respond: Box<Respond>,
}

impl ScriptedHandler {
    pub fn new(
        respond: impl Fn(&SyncChannel, &MessageEnvelope) -> Option<Value> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            observed: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    /// Records without answering anything.
    pub fn silent() -> Arc<Self> {
        Self::new(|_, _| None)
    }

    pub fn observed(&self) -> Vec<Observed> {
        self.observed.lock().clone()
    }

    pub fn observed_action(&self, action: &str) -> Option<Observed> {
        self.observed
            .lock()
            .iter()
            .find(|observed| observed.action == action)
            .cloned()
    }
}

impl MessageHandler for ScriptedHandler {
    fn on_message_received(&self, channel: &SyncChannel, message: &MessageEnvelope) -> bool {
        self.observed.lock().push(Observed {
            action: message.action.clone(),
            body: body(message),
            blocked_depth: channel.blocked_depth(),
        });

        match (self.respond)(channel, message) {
            Some(answer) if message.is_sync() => {
                // The pipe may already be gone in failure scenarios.
                let _ = channel.reply(message, payload(answer));
                true
            }
            Some(_) => true,
            None => !message.is_sync(),
        }
    }
}

/// A peer scripted directly on its endpoint's I/O thread.
pub struct ScriptedPeer {
    received: Arc<Mutex<Vec<MessageEnvelope>>>,
    transport: Arc<dyn Transport>,
    sequence: Arc<SequenceGen>,
}

impl ScriptedPeer {
    /// Answers each sync request with `respond`; `None` means never reply.
    pub fn attach(
        endpoint: &SimEndpoint,
        respond: impl Fn(&MessageEnvelope) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let transport = endpoint.transport();

        let log = Arc::clone(&received);
        let replies = Arc::clone(&transport);
        endpoint.attach(FnListener::new(move |message: MessageEnvelope| {
            log.lock().push(message.clone());
            if message.is_sync() && !message.is_reply() {
                if let Some(answer) = respond(&message) {
                    if let Some(reply) = MessageEnvelope::reply_to(&message, payload(answer)) {
                        let _ = replies.send_async(reply);
                    }
                }
            }
            Delivery::Consumed
        }));

        Self {
            received,
            transport,
            sequence: Arc::new(SequenceGen::new()),
        }
    }

    pub fn received(&self) -> Vec<MessageEnvelope> {
        self.received.lock().clone()
    }

    /// Waits for the first message with `action` and returns it.
    pub fn wait_for(&self, action: &str, timeout: Duration) -> Option<MessageEnvelope> {
        let mut found = None;
        wait_until(timeout, || {
            found = self
                .received
                .lock()
                .iter()
                .find(|message| message.action == action)
                .cloned();
            found.is_some()
        });
        found
    }

    /// Sends a numbered sync request to the other side and returns its id.
    pub fn send_request(&self, action: &str, body: Value) -> MessageId {
        let id = self.sequence.next_id(ROUTE);
        let _ = self.transport.send_async(sync_request(action, body).with_id(id));
        id
    }
}

/// A [`SyncChannel`] running on its own listener thread.
///
/// The thread dispatches everything its endpoint forwards until the party is
/// dropped.
pub struct Party {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Party {
    pub fn spawn(name: &str, endpoint: SimEndpoint, handler: Arc<dyn MessageHandler>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let registry = QueueRegistry::new();
                let shutdown = Arc::new(WaitableEvent::new());
                let channel = open_channel(&endpoint, handler, &registry, &shutdown);
                let inbox = endpoint.inbox();
                while !running.load(Ordering::Acquire) {
                    match inbox.recv_timeout(Duration::from_millis(5)) {
                        Ok(message) => channel.dispatch(&message),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn party thread");

        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for Party {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
