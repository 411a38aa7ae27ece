//! Cross-thread signals.
//!
//! A [`WaitableEvent`] is a manual-reset boolean: once signaled it stays
//! signaled until [`WaitableEvent::reset`] is called. A thread can wait for a
//! single event or for the first of several with [`wait_any`], which is what
//! a blocked synchronous call needs to watch its reply, the shutdown signal
//! and the reentrant dispatch signal at the same time.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Watcher = Box<dyn FnOnce() + Send>;

/// Registration of a pending [`WaitableEvent::watch`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchKey(u64);

/// One blocked thread, registered with every event it waits on.
#[derive(Default)]
struct Waiter {
    fired: Mutex<bool>,
    wakeup: Condvar,
}

impl Waiter {
    fn fire(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        self.wakeup.notify_one();
    }

    /// Returns `false` if the deadline passed first.
    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut fired = self.fired.lock();
        while !*fired {
            match deadline {
                Some(deadline) => {
                    if self.wakeup.wait_until(&mut fired, deadline).timed_out() {
                        return *fired;
                    }
                }
                None => self.wakeup.wait(&mut fired),
            }
        }
        true
    }
}

#[derive(Default)]
struct EventState {
    signaled: bool,
    waiters: Vec<Arc<Waiter>>,
    watchers: Vec<(WatchKey, Watcher)>,
    next_watch: u64,
}

/// Manual-reset event settable from any thread.
#[derive(Default)]
pub struct WaitableEvent {
    state: Mutex<EventState>,
}

impl WaitableEvent {
    /// Creates an unsignaled event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event, waking every waiter and running pending watchers.
    ///
    /// Watchers run on the calling thread after the event lock is released.
    pub fn signal(&self) {
        let watchers = {
            let mut state = self.state.lock();
            state.signaled = true;
            for waiter in state.waiters.drain(..) {
                waiter.fire();
            }
            std::mem::take(&mut state.watchers)
        };
        for (_, watcher) in watchers {
            watcher();
        }
    }

    /// Clears the event.
    pub fn reset(&self) {
        self.state.lock().signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// Waits until the event is signaled or `timeout` elapses.
    ///
    /// Returns `true` if the event was signaled. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        wait_any(&[self], timeout).is_some()
    }

    /// Runs `callback` once, the next time the event is signaled.
    ///
    /// If the event is already signaled the callback runs immediately on the
    /// calling thread and `None` is returned. Otherwise the returned key
    /// cancels the callback through [`WaitableEvent::unwatch`].
    pub fn watch(&self, callback: impl FnOnce() + Send + 'static) -> Option<WatchKey> {
        let mut state = self.state.lock();
        if state.signaled {
            drop(state);
            callback();
            return None;
        }
        let key = WatchKey(state.next_watch);
        state.next_watch += 1;
        state.watchers.push((key, Box::new(callback)));
        Some(key)
    }

    /// Drops a callback registered with [`WaitableEvent::watch`].
    ///
    /// Returns `false` if it already ran or was removed.
    pub fn unwatch(&self, key: WatchKey) -> bool {
        let mut state = self.state.lock();
        let before = state.watchers.len();
        state.watchers.retain(|(registered, _)| *registered != key);
        state.watchers.len() != before
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.state.lock().watchers.len()
    }

    /// Registers `waiter`; returns `true` instead if already signaled.
    fn enqueue(&self, waiter: &Arc<Waiter>) -> bool {
        let mut state = self.state.lock();
        if state.signaled {
            return true;
        }
        state.waiters.push(Arc::clone(waiter));
        false
    }

    fn dequeue(&self, waiter: &Arc<Waiter>) {
        self.state
            .lock()
            .waiters
            .retain(|registered| !Arc::ptr_eq(registered, waiter));
    }
}

impl std::fmt::Debug for WaitableEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitableEvent")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// Waits for the first of `events` to be signaled.
///
/// Returns the index of the lowest signaled event, or `None` on timeout.
pub fn wait_any(events: &[&WaitableEvent], timeout: Option<Duration>) -> Option<usize> {
    wait_any_until(events, deadline_after(timeout))
}

/// Deadline `timeout` from now. A timeout too large to represent has none.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// Like [`wait_any`] with an absolute deadline.
pub fn wait_any_until(events: &[&WaitableEvent], deadline: Option<Instant>) -> Option<usize> {
    loop {
        if let Some(index) = first_signaled(events) {
            return Some(index);
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return None;
        }

        let waiter = Arc::new(Waiter::default());
        let ready = events.iter().any(|event| event.enqueue(&waiter));
        if !ready {
            waiter.wait_until(deadline);
        }
        for event in events {
            event.dequeue(&waiter);
        }
        // An event may have been reset between firing and this check; the
        // loop re-examines the deadline in that case.
    }
}

fn first_signaled(events: &[&WaitableEvent]) -> Option<usize> {
    events.iter().position(|event| event.is_signaled())
}
