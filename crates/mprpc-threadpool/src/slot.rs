//! One slot of the task ring.
//!
//! A slot is a tiny state machine, `Empty → Pushing → Filled → Empty`, with
//! `Stopping` substituting for `Filled` when the pool injects a shutdown
//! marker.  A producer that has been handed this slot by its push ticket
//! waits while the slot is occupied; the consumer holding the matching pop
//! ticket waits while it is not yet filled.  All waiting is per-slot, so
//! producers and consumers working different slots never contend.

use std::sync::{Condvar, Mutex};

/// Where a slot is in its fill/drain cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotState {
    /// Nothing stored; a producer may claim the slot.
    Empty,
    /// A producer is moving its payload in.
    Pushing,
    /// A payload is stored and waiting for its consumer.
    Filled,
    /// A shutdown marker; the consumer that takes it exits.
    Stopping,
}

/// State word and payload cell of one slot.
#[derive(Debug)]
struct SlotData<P> {
    /// Current state.
    state: SlotState,
    /// The payload, present exactly while `state == Filled`.
    payload: Option<P>,
}

/// One slot of the ring.
#[derive(Debug)]
pub(crate) struct Slot<P> {
    /// State and payload, guarded together.
    data: Mutex<SlotData<P>>,
    /// Woken on every state transition.
    cond: Condvar,
}

impl<P> Slot<P> {
    /// Return a new empty slot.
    pub(crate) fn new() -> Self {
        Slot {
            data: Mutex::new(SlotData {
                state: SlotState::Empty,
                payload: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Store `payload`, waiting until the slot is empty.
    pub(crate) fn fill(&self, payload: P) {
        let mut data = self.data.lock().expect("poisoned lock");
        while data.state != SlotState::Empty {
            data = self.cond.wait(data).expect("poisoned lock");
        }
        data.state = SlotState::Pushing;
        data.payload = Some(payload);
        data.state = SlotState::Filled;
        self.cond.notify_all();
    }

    /// Store a shutdown marker, waiting until the slot is empty.
    pub(crate) fn fill_stop(&self) {
        let mut data = self.data.lock().expect("poisoned lock");
        while data.state != SlotState::Empty {
            data = self.cond.wait(data).expect("poisoned lock");
        }
        data.state = SlotState::Stopping;
        self.cond.notify_all();
    }

    /// Wait for the slot to be filled and take what is inside.
    ///
    /// Returns `None` for a shutdown marker.  Either way the slot is empty
    /// again when this returns.
    pub(crate) fn take(&self) -> Option<P> {
        let mut data = self.data.lock().expect("poisoned lock");
        loop {
            match data.state {
                SlotState::Filled => {
                    let payload = data.payload.take();
                    debug_assert!(payload.is_some());
                    data.state = SlotState::Empty;
                    self.cond.notify_all();
                    return payload;
                }
                SlotState::Stopping => {
                    data.state = SlotState::Empty;
                    self.cond.notify_all();
                    return None;
                }
                SlotState::Empty | SlotState::Pushing => {
                    data = self.cond.wait(data).expect("poisoned lock");
                }
            }
        }
    }

    /// Testing only: return true if a producer could fill this slot without
    /// waiting.
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.data.lock().expect("poisoned lock").state == SlotState::Empty
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fill_take_cycle() {
        let slot = Slot::new();
        assert!(slot.is_empty());
        slot.fill(7_u32);
        assert!(!slot.is_empty());
        assert_eq!(slot.take(), Some(7));
        assert!(slot.is_empty());
    }

    #[test]
    fn stop_marker() {
        let slot: Slot<u32> = Slot::new();
        slot.fill_stop();
        assert_eq!(slot.take(), None);
        assert!(slot.is_empty());
    }

    #[test]
    fn producer_waits_for_consumer() {
        let slot = Arc::new(Slot::new());
        slot.fill(1_u32);
        let producer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.fill(2))
        };
        // The producer is blocked on the occupied slot until we drain it.
        assert_eq!(slot.take(), Some(1));
        producer.join().unwrap();
        assert_eq!(slot.take(), Some(2));
    }
}
