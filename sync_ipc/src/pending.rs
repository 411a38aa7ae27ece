//! Table of outstanding synchronous calls.
//!
//! Every blocking send registers a [`CallSlot`] here before its request is
//! handed to the transport. Slots are kept in issue order, so the most
//! recently inserted slot is the innermost nested call. Replies are matched
//! by exact id through a hash index, independent of nesting depth.
//!
//! A call leaves `Issued` exactly once. Reply arrival, cancellation and the
//! caller's own timeout race for the table lock; whichever takes it first
//! decides the outcome and the others become no-ops.

use crate::error::CancelReason;
use crate::error::SyncError;
use crate::event::WaitableEvent;
use ipc::{MessageEnvelope, MessageId};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Stable handle to a registered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallSlot(u64);

/// Terminal outcome of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Replied(MessageEnvelope),
    TimedOut,
    Canceled(CancelReason),
}

/// Observable state of a registered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Issued,
    Replied,
    TimedOut,
    Canceled,
}

/// Result of offering an inbound reply to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The reply completed an issued call.
    Resolved,
    /// No issued call matches; the reply is handed back.
    Stale(MessageEnvelope),
}

enum CallState {
    Issued,
    Done(Outcome),
}

struct PendingCall {
    id: MessageId,
    done: Arc<WaitableEvent>,
    state: CallState,
}

impl PendingCall {
    fn status(&self) -> CallStatus {
        match &self.state {
            CallState::Issued => CallStatus::Issued,
            CallState::Done(Outcome::Replied(_)) => CallStatus::Replied,
            CallState::Done(Outcome::TimedOut) => CallStatus::TimedOut,
            CallState::Done(Outcome::Canceled(_)) => CallStatus::Canceled,
        }
    }
}

#[derive(Default)]
struct TableInner {
    next_slot: u64,
    calls: BTreeMap<CallSlot, PendingCall>,
    index: HashMap<MessageId, CallSlot>,
}

/// Outstanding calls of one channel.
#[derive(Default)]
pub struct PendingCallTable {
    inner: Mutex<TableInner>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an issued call and returns its slot and completion event.
    ///
    /// Fails if a call with the same id is still registered.
    pub fn push(&self, id: MessageId) -> Result<(CallSlot, Arc<WaitableEvent>), SyncError> {
        let id = id.as_request();
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&id) {
            return Err(SyncError::InvalidRequest(format!(
                "{} is already outstanding",
                id
            )));
        }

        let slot = CallSlot(inner.next_slot);
        inner.next_slot += 1;
        let done = Arc::new(WaitableEvent::new());
        inner.calls.insert(
            slot,
            PendingCall {
                id,
                done: Arc::clone(&done),
                state: CallState::Issued,
            },
        );
        inner.index.insert(id, slot);
        Ok((slot, done))
    }

    /// Completes the issued call `reply` answers and sets its completion event.
    pub fn try_resolve(&self, reply: MessageEnvelope) -> Resolution {
        let Some(id) = reply.id.filter(|id| id.is_reply()) else {
            return Resolution::Stale(reply);
        };

        let done = {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.index.get(&id.as_request()).copied() else {
                return Resolution::Stale(reply);
            };
            let Some(call) = inner.calls.get_mut(&slot) else {
                return Resolution::Stale(reply);
            };
            if !matches!(call.state, CallState::Issued) {
                return Resolution::Stale(reply);
            }
            call.state = CallState::Done(Outcome::Replied(reply));
            Arc::clone(&call.done)
        };

        debug!("Resolved sync call {}", id.as_request());
        done.signal();
        Resolution::Resolved
    }

    /// Removes the call and returns how it ended.
    ///
    /// If the call is still issued, `fallback` becomes its outcome. This is
    /// how the caller records a timeout or a shutdown it observed itself.
    pub fn settle(&self, slot: CallSlot, fallback: Option<Outcome>) -> Outcome {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.calls.remove(&slot);
            if let Some(call) = &removed {
                inner.index.remove(&call.id);
            }
            removed
        };

        match removed.map(|call| call.state) {
            Some(CallState::Done(outcome)) => outcome,
            Some(CallState::Issued) | None => {
                fallback.unwrap_or(Outcome::Canceled(CancelReason::ChannelClosed))
            }
        }
    }

    /// Cancels every issued call and sets all their completion events.
    ///
    /// Returns the number of calls canceled.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let done: Vec<Arc<WaitableEvent>> = {
            let mut inner = self.inner.lock();
            inner
                .calls
                .values_mut()
                .filter(|call| matches!(call.state, CallState::Issued))
                .map(|call| {
                    call.state = CallState::Done(Outcome::Canceled(reason));
                    Arc::clone(&call.done)
                })
                .collect()
        };

        if !done.is_empty() {
            info!("Canceling {} pending sync call(s): {:?}", done.len(), reason);
        }
        for event in &done {
            event.signal();
        }
        done.len()
    }

    /// Returns the state of the call registered under `id`.
    pub fn status(&self, id: MessageId) -> Option<CallStatus> {
        let inner = self.inner.lock();
        let slot = inner.index.get(&id.as_request())?;
        inner.calls.get(slot).map(PendingCall::status)
    }

    /// Returns registered ids, outermost call first.
    pub fn outstanding(&self) -> Vec<MessageId> {
        self.inner.lock().calls.values().map(|call| call.id).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::RoutingId;
    use ipc::MessagePayload;
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn id(sequence: u32) -> MessageId {
        MessageId::new(RoutingId::new(1), sequence)
    }

    fn reply(sequence: u32, value: serde_json::Value) -> MessageEnvelope {
        MessageEnvelope::new(RoutingId::new(1), "reply", MessagePayload::new(&value).unwrap())
            .with_id(id(sequence).as_reply())
    }

    #[test]
    fn test_push_and_resolve() {
        let table = PendingCallTable::new();
        let (slot, done) = table.push(id(7)).unwrap();
        assert_eq!(table.status(id(7)), Some(CallStatus::Issued));
        assert!(!done.is_signaled());

        let answer = reply(7, json!({"pong": true}));
        assert_eq!(table.try_resolve(answer.clone()), Resolution::Resolved);
        assert!(done.is_signaled());
        assert_eq!(table.status(id(7)), Some(CallStatus::Replied));

        assert_eq!(table.settle(slot, None), Outcome::Replied(answer));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = PendingCallTable::new();
        table.push(id(1)).unwrap();
        let err = table.push(id(1)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidRequest(_)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unknown_reply_is_stale() {
        let table = PendingCallTable::new();
        let (_slot, done) = table.push(id(1)).unwrap();

        let stray = reply(2, json!(null));
        assert_eq!(table.try_resolve(stray.clone()), Resolution::Stale(stray));
        assert!(!done.is_signaled());
        assert_eq!(table.status(id(1)), Some(CallStatus::Issued));
    }

    #[test]
    fn test_request_offered_as_reply_is_stale() {
        let table = PendingCallTable::new();
        table.push(id(1)).unwrap();
        let request =
            MessageEnvelope::sync_request(RoutingId::new(1), "op", MessagePayload::empty())
                .with_id(id(1));
        assert!(matches!(table.try_resolve(request), Resolution::Stale(_)));
    }

    #[test]
    fn test_second_reply_is_stale() {
        let table = PendingCallTable::new();
        let (slot, _done) = table.push(id(3)).unwrap();
        let first = reply(3, json!(1));
        assert_eq!(table.try_resolve(first.clone()), Resolution::Resolved);
        assert!(matches!(
            table.try_resolve(reply(3, json!(2))),
            Resolution::Stale(_)
        ));
        assert_eq!(table.settle(slot, None), Outcome::Replied(first));
    }

    #[test]
    fn test_reply_wins_over_later_timeout() {
        let table = PendingCallTable::new();
        let (slot, _done) = table.push(id(4)).unwrap();
        let answer = reply(4, json!("late but first"));
        table.try_resolve(answer.clone());
        assert_eq!(
            table.settle(slot, Some(Outcome::TimedOut)),
            Outcome::Replied(answer)
        );
    }

    #[test]
    fn test_reply_after_timeout_is_stale() {
        let table = PendingCallTable::new();
        let (slot, _done) = table.push(id(5)).unwrap();
        assert_eq!(table.settle(slot, Some(Outcome::TimedOut)), Outcome::TimedOut);
        assert!(matches!(
            table.try_resolve(reply(5, json!(null))),
            Resolution::Stale(_)
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_cancel_beats_later_reply() {
        let table = PendingCallTable::new();
        let (slot, done) = table.push(id(6)).unwrap();
        assert_eq!(table.cancel_all(CancelReason::ChannelError), 1);
        assert!(done.is_signaled());
        assert!(matches!(
            table.try_resolve(reply(6, json!(null))),
            Resolution::Stale(_)
        ));
        assert_eq!(
            table.settle(slot, Some(Outcome::TimedOut)),
            Outcome::Canceled(CancelReason::ChannelError)
        );
    }

    #[test]
    fn test_cancel_skips_completed_calls() {
        let table = PendingCallTable::new();
        let (replied, _) = table.push(id(1)).unwrap();
        let (issued, _) = table.push(id(2)).unwrap();
        let answer = reply(1, json!(true));
        table.try_resolve(answer.clone());

        assert_eq!(table.cancel_all(CancelReason::Shutdown), 1);
        assert_eq!(table.settle(replied, None), Outcome::Replied(answer));
        assert_eq!(
            table.settle(issued, None),
            Outcome::Canceled(CancelReason::Shutdown)
        );
    }

    #[test]
    fn test_nested_calls_resolve_independently() {
        let table = PendingCallTable::new();
        let (outer, outer_done) = table.push(id(1)).unwrap();
        let (inner, inner_done) = table.push(id(2)).unwrap();
        assert_eq!(table.outstanding(), vec![id(1), id(2)]);

        // Inner reply first, outer unaffected.
        table.try_resolve(reply(2, json!("inner")));
        assert!(inner_done.is_signaled());
        assert!(!outer_done.is_signaled());
        assert!(matches!(table.settle(inner, None), Outcome::Replied(_)));
        assert_eq!(table.outstanding(), vec![id(1)]);

        table.try_resolve(reply(1, json!("outer")));
        assert!(matches!(table.settle(outer, None), Outcome::Replied(_)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_out_of_order_replies() {
        let table = PendingCallTable::new();
        let slots: Vec<_> = (1..=3).map(|seq| table.push(id(seq)).unwrap().0).collect();
        table.try_resolve(reply(2, json!(2)));
        table.try_resolve(reply(3, json!(3)));
        table.try_resolve(reply(1, json!(1)));

        for (seq, slot) in (1..=3).zip(slots) {
            match table.settle(slot, None) {
                Outcome::Replied(message) => {
                    assert_eq!(message.id, Some(id(seq).as_reply()));
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[test]
    fn test_cancel_all_wakes_every_waiter() {
        let table = Arc::new(PendingCallTable::new());
        let handles: Vec<_> = (1..=4)
            .map(|seq| {
                let (slot, done) = table.push(id(seq)).unwrap();
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    assert!(done.wait(Some(Duration::from_secs(5))));
                    table.settle(slot, Some(Outcome::TimedOut))
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(table.cancel_all(CancelReason::ChannelError), 4);
        for handle in handles {
            assert_eq!(
                handle.join().unwrap(),
                Outcome::Canceled(CancelReason::ChannelError)
            );
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_reply_and_cancel_race_has_single_winner() {
        for _ in 0..50 {
            let table = Arc::new(PendingCallTable::new());
            let (slot, done) = table.push(id(9)).unwrap();

            let resolver = {
                let table = Arc::clone(&table);
                thread::spawn(move || table.try_resolve(reply(9, json!(null))))
            };
            let canceler = {
                let table = Arc::clone(&table);
                thread::spawn(move || table.cancel_all(CancelReason::ChannelClosed))
            };
            let resolution = resolver.join().unwrap();
            let canceled = canceler.join().unwrap();

            assert!(done.is_signaled());
            match table.settle(slot, None) {
                Outcome::Replied(_) => {
                    assert_eq!(resolution, Resolution::Resolved);
                    assert_eq!(canceled, 0);
                }
                Outcome::Canceled(CancelReason::ChannelClosed) => {
                    assert!(matches!(resolution, Resolution::Stale(_)));
                    assert_eq!(canceled, 1);
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }
}
