//! Synchronization-context internals.
//!
//! A synchronization context serializes its tasks without pinning them to a
//! thread.  Tasks are stamped with a per-context sequence number at
//! submission; whichever worker pops one parks it in the context's mailbox
//! and, if nobody currently holds the context, becomes the holder and drains
//! the mailbox in sequence order.  A gap in the sequence (an earlier task
//! still travelling through the ring) ends the drain; the worker that
//! eventually delivers the missing task becomes the next holder.
//!
//! This gives both halves of the contract: tasks of one context never
//! overlap (there is at most one holder) and they run in submission order
//! (only the next expected sequence number is ever eligible).

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Mailbox and drain gate of one context.
#[derive(Debug)]
struct Pending<T> {
    /// Sequence number of the next task allowed to run.
    next_run: u64,
    /// Parked tasks, keyed by their sequence number.
    parked: BTreeMap<u64, T>,
    /// True while some worker is draining this context.
    held: bool,
}

/// Shared state of one synchronization context.
#[derive(Debug)]
pub(crate) struct ContextStub<T> {
    /// Next sequence number to stamp on a submission.
    produce_seq: AtomicU64,
    /// Parked tasks plus the drain gate.
    pending: Mutex<Pending<T>>,
}

impl<T> ContextStub<T> {
    /// Return a fresh context stub.
    pub(crate) fn new() -> Self {
        ContextStub {
            produce_seq: AtomicU64::new(0),
            pending: Mutex::new(Pending {
                next_run: 0,
                parked: BTreeMap::new(),
                held: false,
            }),
        }
    }

    /// Stamp one submission.  Called once per `push`, in submission order.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.produce_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver the task stamped `seq`, running every runnable task through
    /// `run` if this worker ends up holding the context.
    ///
    /// `run` is invoked outside the mailbox lock.
    pub(crate) fn deliver<F: FnMut(T)>(&self, seq: u64, task: T, mut run: F) {
        let mut pending = self.pending.lock().expect("poisoned lock");
        let replaced = pending.parked.insert(seq, task);
        debug_assert!(replaced.is_none());
        if pending.held {
            // The current holder will pick it up.
            return;
        }
        pending.held = true;
        loop {
            let next = pending.next_run;
            let Some(task) = pending.parked.remove(&next) else {
                break;
            };
            pending.next_run = next + 1;
            drop(pending);
            run(task);
            pending = self.pending.lock().expect("poisoned lock");
        }
        pending.held = false;
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn in_order_delivery_runs_immediately() {
        let stub = ContextStub::new();
        let mut ran = Vec::new();
        for i in 0..4_u64 {
            assert_eq!(stub.next_sequence(), i);
            stub.deliver(i, i, |t| ran.push(t));
        }
        assert_eq!(ran, vec![0, 1, 2, 3]);
    }

    #[test]
    fn gap_parks_until_missing_task_arrives() {
        let stub = ContextStub::new();
        stub.next_sequence();
        stub.next_sequence();
        stub.next_sequence();
        let mut ran = Vec::new();
        // Sequence 1 and 2 overtake sequence 0 in the ring.
        stub.deliver(1, 1_u64, |t| ran.push(t));
        stub.deliver(2, 2, |t| ran.push(t));
        assert!(ran.is_empty());
        // The straggler unblocks everything, in order.
        stub.deliver(0, 0, |t| ran.push(t));
        assert_eq!(ran, vec![0, 1, 2]);
    }
}
