//! Connected in-memory endpoints.

use crate::io_thread::IoThread;
use crossbeam::channel::{self, Receiver, Sender};
use ipc::{ChannelListener, Delivery, MessageEnvelope, Transport, TransportError};
use log::{debug, trace};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

struct EndpointShared {
    name: String,
    io: IoThread,
    listener: Mutex<Option<Arc<dyn ChannelListener>>>,
    forwarded: Sender<MessageEnvelope>,
    inbox: Receiver<MessageEnvelope>,
    closed: AtomicBool,
}

impl EndpointShared {
    fn spawn(name: String) -> io::Result<Arc<Self>> {
        let io = IoThread::spawn(&format!("{}-io", name))?;
        let (forwarded, inbox) = channel::unbounded();
        Ok(Arc::new(Self {
            name,
            io,
            listener: Mutex::new(None),
            forwarded,
            inbox,
            closed: AtomicBool::new(false),
        }))
    }

    fn listener(&self) -> Option<Arc<dyn ChannelListener>> {
        self.listener.lock().clone()
    }

    /// Queues `message` for this endpoint's I/O thread.
    fn deliver(self: &Arc<Self>, message: MessageEnvelope) -> bool {
        let shared = Arc::clone(self);
        self.io.post(move || shared.receive(message))
    }

    fn receive(&self, message: MessageEnvelope) {
        if self.closed.load(Ordering::Acquire) {
            trace!("{}: dropping {} after close", self.name, message.action);
            return;
        }
        let delivery = match self.listener() {
            Some(listener) => listener.on_message_received(message),
            None => Delivery::Forward(message),
        };
        if let Delivery::Forward(message) = delivery {
            let _ = self.forwarded.send(message);
        }
    }

    fn notify(self: &Arc<Self>, event: fn(&dyn ChannelListener)) {
        let shared = Arc::clone(self);
        self.io.post(move || {
            if let Some(listener) = shared.listener() {
                event(listener.as_ref());
            }
        });
    }

    fn fail(self: &Arc<Self>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("{}: channel error", self.name);
            self.notify(|listener| listener.on_channel_error());
        }
    }

    fn close(self: &Arc<Self>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("{}: channel closed", self.name);
            self.notify(|listener| listener.on_channel_closed());
        }
    }
}

/// Outbound half of a [`SimEndpoint`].
struct SimTransport {
    local: Arc<EndpointShared>,
    peer: Arc<EndpointShared>,
}

impl Transport for SimTransport {
    fn send_async(&self, message: MessageEnvelope) -> Result<(), TransportError> {
        if self.local.closed.load(Ordering::Acquire) || self.peer.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        trace!("{} -> {}: {}", self.local.name, self.peer.name, message.action);
        if self.peer.deliver(message) {
            Ok(())
        } else {
            Err(TransportError::Failed(format!(
                "{} I/O thread stopped",
                self.peer.name
            )))
        }
    }
}

/// Injects faults into an endpoint from any thread.
#[derive(Clone)]
pub struct FaultHandle {
    local: Arc<EndpointShared>,
    peer: Arc<EndpointShared>,
}

impl FaultHandle {
    /// Reports a channel error on this endpoint only.
    pub fn fail(&self) {
        self.local.fail();
    }

    /// Closes the pipe; both endpoints see the close.
    pub fn close(&self) {
        self.local.close();
        self.peer.close();
    }
}

/// One side of an in-memory pipe with its own I/O thread.
///
/// Inbound messages are offered to the attached listener on the I/O thread.
/// Messages it forwards land in [`SimEndpoint::inbox`], to be dispatched by
/// the listener thread.
pub struct SimEndpoint {
    local: Arc<EndpointShared>,
    peer: Arc<EndpointShared>,
}

impl SimEndpoint {
    pub fn name(&self) -> &str {
        &self.local.name
    }

    /// Sends to the peer endpoint.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(SimTransport {
            local: Arc::clone(&self.local),
            peer: Arc::clone(&self.peer),
        })
    }

    /// Installs the listener and reports the channel as opened.
    pub fn attach(&self, listener: Arc<dyn ChannelListener>) {
        *self.local.listener.lock() = Some(listener);
        self.local.notify(|listener| listener.on_channel_opened());
    }

    /// Messages the listener did not consume, in arrival order.
    pub fn inbox(&self) -> Receiver<MessageEnvelope> {
        self.local.inbox.clone()
    }

    /// Delivers `message` to this endpoint as if the peer had sent it.
    pub fn inject(&self, message: MessageEnvelope) -> bool {
        self.local.deliver(message)
    }

    /// Reports a channel error on this endpoint.
    pub fn fail(&self) {
        self.local.fail();
    }

    /// Closes the pipe; both endpoints see the close.
    pub fn close(&self) {
        self.fault_handle().close();
    }

    pub fn fault_handle(&self) -> FaultHandle {
        FaultHandle {
            local: Arc::clone(&self.local),
            peer: Arc::clone(&self.peer),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.local.closed.load(Ordering::Acquire)
    }

    /// Blocks until everything already queued for this endpoint was delivered.
    pub fn flush(&self) {
        self.local.io.flush();
    }

    pub fn io_thread_id(&self) -> ThreadId {
        self.local.io.thread_id()
    }
}

/// Creates two connected endpoints, each with its own I/O thread.
pub fn sim_pipe(name: &str) -> io::Result<(SimEndpoint, SimEndpoint)> {
    let a = EndpointShared::spawn(format!("{}-a", name))?;
    let b = EndpointShared::spawn(format!("{}-b", name))?;
    Ok((
        SimEndpoint {
            local: Arc::clone(&a),
            peer: Arc::clone(&b),
        },
        SimEndpoint { local: b, peer: a },
    ))
}

/// Closure-backed listener, handy for scripting a peer.
pub struct FnListener<F> {
    on_message: F,
}

impl<F> FnListener<F>
where
    F: Fn(MessageEnvelope) -> Delivery + Send + Sync + 'static,
{
    pub fn new(on_message: F) -> Arc<Self> {
        Arc::new(Self { on_message })
    }
}

impl<F> ChannelListener for FnListener<F>
where
    F: Fn(MessageEnvelope) -> Delivery + Send + Sync,
{
    fn on_message_received(&self, message: MessageEnvelope) -> Delivery {
        (self.on_message)(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::RoutingId;
    use ipc::MessagePayload;
    use std::thread;
    use std::time::Duration;

    fn note(action: &str) -> MessageEnvelope {
        MessageEnvelope::new(RoutingId::new(1), action, MessagePayload::empty())
    }

    #[derive(Default)]
    struct Events {
        opened: AtomicBool,
        errored: AtomicBool,
        closed: AtomicBool,
        threads: Mutex<Vec<ThreadId>>,
    }

    impl ChannelListener for Events {
        fn on_message_received(&self, message: MessageEnvelope) -> Delivery {
            self.threads.lock().push(thread::current().id());
            if message.action == "keep" {
                Delivery::Consumed
            } else {
                Delivery::Forward(message)
            }
        }

        fn on_channel_opened(&self) {
            self.opened.store(true, Ordering::SeqCst);
        }

        fn on_channel_error(&self) {
            self.errored.store(true, Ordering::SeqCst);
        }

        fn on_channel_closed(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_delivery_runs_on_peer_io_thread() {
        let (a, b) = sim_pipe("pipe").unwrap();
        let events = Arc::new(Events::default());
        b.attach(events.clone());

        a.transport().send_async(note("keep")).unwrap();
        a.transport().send_async(note("pass")).unwrap();
        b.flush();

        assert!(events.opened.load(Ordering::SeqCst));
        assert!(events
            .threads
            .lock()
            .iter()
            .all(|thread| *thread == b.io_thread_id()));
        let forwarded: Vec<_> = b.inbox().try_iter().map(|message| message.action).collect();
        assert_eq!(forwarded, vec!["pass"]);
    }

    #[test]
    fn test_unattached_endpoint_forwards_everything() {
        let (a, b) = sim_pipe("pipe").unwrap();
        a.transport().send_async(note("one")).unwrap();
        let received = b.inbox().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received.action, "one");
    }

    #[test]
    fn test_inject_delivers_locally() {
        let (a, _b) = sim_pipe("pipe").unwrap();
        assert!(a.inject(note("injected")));
        let received = a.inbox().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received.action, "injected");
    }

    #[test]
    fn test_fail_affects_one_side() {
        let (a, b) = sim_pipe("pipe").unwrap();
        let a_events = Arc::new(Events::default());
        let b_events = Arc::new(Events::default());
        a.attach(a_events.clone());
        b.attach(b_events.clone());

        a.fail();
        a.flush();
        b.flush();
        assert!(a_events.errored.load(Ordering::SeqCst));
        assert!(!b_events.errored.load(Ordering::SeqCst));
        assert_eq!(a.transport().send_async(note("late")), Err(TransportError::Closed));
    }

    #[test]
    fn test_close_reaches_both_sides() {
        let (a, b) = sim_pipe("pipe").unwrap();
        let a_events = Arc::new(Events::default());
        let b_events = Arc::new(Events::default());
        a.attach(a_events.clone());
        b.attach(b_events.clone());

        b.fault_handle().close();
        a.flush();
        b.flush();
        assert!(a_events.closed.load(Ordering::SeqCst));
        assert!(b_events.closed.load(Ordering::SeqCst));
        assert!(a.is_closed());
        assert_eq!(b.transport().send_async(note("late")), Err(TransportError::Closed));
    }

    #[test]
    fn test_fn_listener() {
        let (a, b) = sim_pipe("pipe").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        b.attach(FnListener::new(move |message: MessageEnvelope| {
            recorder.lock().push(message.action);
            Delivery::Consumed
        }));

        a.transport().send_async(note("scripted")).unwrap();
        b.flush();
        assert_eq!(*seen.lock(), vec!["scripted".to_string()]);
        assert!(b.inbox().is_empty());
    }
}
