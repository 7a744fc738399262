//! The scheduler owning the reactors, and the manager routing to them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::debug;

use mprpc_base::{ActorId, Event, UniqueId};

use crate::actor::Actor;
use crate::ids;
use crate::reactor::{run_loop, InboxItem, ReactorShared};
use crate::{Error, Result};

/// Shared routing table: one entry per reactor.
struct ManagerInner {
    /// The reactors' cross-thread faces, indexed by reactor index.
    reactors: Vec<Arc<ReactorShared>>,
}

/// The cross-thread face of a running [`Scheduler`].
///
/// Cheap to clone; safe to use from any thread, including from inside
/// another reactor's callbacks.
#[derive(Clone)]
pub struct Manager {
    /// The routing table.
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Raise `event` at the actor named by `actor_id`.
    ///
    /// Returns false iff the actor has exited or was never registered; a
    /// true return means the event was queued toward the actor's reactor
    /// (delivery can still be cut short by the actor exiting first).
    pub fn notify(&self, actor_id: ActorId, event: Event) -> bool {
        if actor_id.is_invalid() {
            return false;
        }
        let (reactor_index, slot) = ids::unpack(actor_id.index());
        match self.inner.reactors.get(reactor_index) {
            Some(shared) => shared.notify(slot, actor_id.generation(), event),
            None => false,
        }
    }
}

/// Owns N reactors bound to N threads and registers actors onto them.
pub struct Scheduler {
    /// The cross-thread face, cloned out to users.
    manager: Manager,
    /// Reactor thread handles, drained on stop.
    threads: Vec<thread::JoinHandle<()>>,
    /// Round-robin cursor for actor placement.
    next_reactor: AtomicUsize,
}

impl Scheduler {
    /// Start `thread_count` reactors, each on its own thread.
    pub fn start(thread_count: usize) -> Result<Self> {
        if thread_count == 0 {
            return Err(Error::Configuration("thread_count must be nonzero"));
        }
        let reactors: Vec<Arc<ReactorShared>> = (0..thread_count)
            .map(|_| Arc::new(ReactorShared::new()))
            .collect();
        let manager = Manager {
            inner: Arc::new(ManagerInner {
                reactors: reactors.clone(),
            }),
        };
        let mut scheduler = Scheduler {
            manager: manager.clone(),
            threads: Vec::with_capacity(thread_count),
            next_reactor: AtomicUsize::new(0),
        };
        for (reactor_index, shared) in reactors.into_iter().enumerate() {
            let manager = manager.clone();
            let spawned = thread::Builder::new()
                .name(format!("mprpc-reactor-{reactor_index}"))
                .spawn(move || run_loop(shared, reactor_index, manager));
            match spawned {
                Ok(handle) => scheduler.threads.push(handle),
                Err(e) => {
                    scheduler.stop();
                    return Err(Error::Spawn(Arc::new(e)));
                }
            }
        }
        debug!(thread_count, "scheduler started");
        Ok(scheduler)
    }

    /// Return a clone of the manager.
    pub fn manager(&self) -> Manager {
        self.manager.clone()
    }

    /// Register `actor` on the next reactor in round-robin order and post
    /// its start event.  Returns the actor's stable id.
    pub fn start_actor(&self, actor: Box<dyn Actor>, start_event: Event) -> Result<ActorId> {
        let count = self.manager.inner.reactors.len();
        let reactor_index = self.next_reactor.fetch_add(1, Ordering::Relaxed) % count;
        let shared = &self.manager.inner.reactors[reactor_index];
        let (slot, generation) = shared.allocate_slot().ok_or(Error::ShuttingDown)?;
        let posted = shared.post(InboxItem::Register {
            slot,
            generation,
            actor,
            start_event,
        });
        if !posted {
            return Err(Error::ShuttingDown);
        }
        Ok(UniqueId::new(ids::pack(reactor_index, slot), generation))
    }

    /// Stop every reactor and join their threads.  Actors still registered
    /// are torn down without their queued events.  Idempotent.
    pub fn stop(&mut self) {
        for shared in &self.manager.inner.reactors {
            shared.stop();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
