//! One reactor: its cross-thread face and its event loop.
//!
//! The loop is the classic cooperative shape: compute the next timer
//! deadline, block until then or until another thread wakes us, drain the
//! cross-thread inbox into per-actor queues, fire expired timers, then run
//! every actor with pending work, FIFO per actor.  An actor's events are
//! only ever processed here, on this thread.
//!
//! With transport I/O out of scope the blocking primitive is a condition
//! variable rather than an event fd; the wake-up contract is the same.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::trace;

use mprpc_base::{ActorId, Event, EventKind, Generation};

use crate::actor::Actor;
use crate::context::ReactorContext;
use crate::ids;
use crate::scheduler::Manager;
use crate::timer_queue::TimerQueue;

/// Log target for this module.
const TARGET: &str = "mprpc_reactor::reactor";

/// One queued work item of an actor.
pub(crate) enum Pending {
    /// An event to hand to `on_event`.
    Event(Event),
    /// The teardown marker planted by `post_stop`.
    StopMarker {
        /// True until the marker has been cycled through the queue once.
        repost: bool,
        /// Event delivered last of all, if any.
        finalizer: Option<Event>,
    },
}

/// Lifecycle of an actor cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CellState {
    /// No actor in this slot.
    Vacant,
    /// Actor registered and accepting events.
    Running,
    /// Teardown requested; queued events still drain.
    Stopping,
}

/// Loop-local state of one registered actor.
pub(crate) struct ActorCell {
    /// Generation of this slot; must match incoming notifications.
    pub(crate) generation: Generation,
    /// The actor itself.  Taken out while one of its callbacks runs.
    pub(crate) actor: Option<Box<dyn Actor>>,
    /// Queued work, FIFO.
    pub(crate) pending: VecDeque<Pending>,
    /// Where the cell is in its lifecycle.
    pub(crate) state: CellState,
    /// True while the slot sits on the loop's run queue.
    pub(crate) queued: bool,
}

impl ActorCell {
    /// Return an empty cell.
    pub(crate) fn vacant() -> Self {
        ActorCell {
            generation: 0,
            actor: None,
            pending: VecDeque::new(),
            state: CellState::Vacant,
            queued: false,
        }
    }
}

/// An item of the cross-thread inbox.
pub(crate) enum InboxItem {
    /// Install a new actor in its pre-allocated slot.
    Register {
        /// Slot reserved by the registry.
        slot: usize,
        /// Generation the registry stamped on the slot.
        generation: Generation,
        /// The actor.
        actor: Box<dyn Actor>,
        /// First event it will see.
        start_event: Event,
    },
    /// Deliver an event raised from another thread.
    Notify {
        /// Target slot.
        slot: usize,
        /// Generation the raiser believed the slot had.
        generation: Generation,
        /// The event.
        event: Event,
    },
}

/// One slot of the shared registry.
#[derive(Clone, Copy, Debug)]
struct RegistrySlot {
    /// Current generation; bumped when the slot is freed.
    generation: Generation,
    /// True between allocation and teardown.
    live: bool,
}

/// The registry answering "is this actor id still current?" from any
/// thread, and allocating slots synchronously for `start_actor`.
#[derive(Debug, Default)]
struct Registry {
    /// One entry per slot ever allocated.
    slots: Vec<RegistrySlot>,
    /// Freed slots awaiting reuse.
    free: Vec<usize>,
}

/// The cross-thread face of one reactor.
pub(crate) struct ReactorShared {
    /// Items queued for the loop.
    inbox: Mutex<Vec<InboxItem>>,
    /// Wakes the loop from its timed wait.
    cond: Condvar,
    /// Cleared on shutdown.
    running: AtomicBool,
    /// Slot allocation and liveness, shared with `notify`.
    registry: Mutex<Registry>,
}

impl ReactorShared {
    /// Return a new shared face.
    pub(crate) fn new() -> Self {
        ReactorShared {
            inbox: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Return true until shutdown begins.
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Reserve a slot for a new actor; `None` once shutdown began.
    pub(crate) fn allocate_slot(&self) -> Option<(usize, Generation)> {
        if !self.is_running() {
            return None;
        }
        let mut registry = self.registry.lock().expect("poisoned lock");
        let slot = match registry.free.pop() {
            Some(slot) => slot,
            None => {
                if registry.slots.len() >= ids::MAX_SLOT {
                    return None;
                }
                registry.slots.push(RegistrySlot {
                    generation: 0,
                    live: false,
                });
                registry.slots.len() - 1
            }
        };
        let entry = &mut registry.slots[slot];
        entry.live = true;
        Some((slot, entry.generation))
    }

    /// Release a slot, invalidating every id that pointed at it.
    fn free_slot(&self, slot: usize) {
        let mut registry = self.registry.lock().expect("poisoned lock");
        let entry = &mut registry.slots[slot];
        entry.live = false;
        entry.generation = entry.generation.wrapping_add(1);
        registry.free.push(slot);
    }

    /// Queue an inbox item and wake the loop.  False once shutdown began.
    pub(crate) fn post(&self, item: InboxItem) -> bool {
        if !self.is_running() {
            return false;
        }
        self.inbox.lock().expect("poisoned lock").push(item);
        self.cond.notify_one();
        true
    }

    /// Raise `event` at the actor in `slot`, if the id is still current.
    pub(crate) fn notify(&self, slot: usize, generation: Generation, event: Event) -> bool {
        {
            let registry = self.registry.lock().expect("poisoned lock");
            let current = match registry.slots.get(slot) {
                Some(entry) => entry.live && entry.generation == generation,
                None => false,
            };
            if !current {
                return false;
            }
        }
        self.post(InboxItem::Notify {
            slot,
            generation,
            event,
        })
    }

    /// Begin shutdown and wake the loop.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        // Take the inbox lock while notifying: the loop checks `running`
        // under that lock before it waits, so the wake cannot fall into the
        // gap between its check and its wait.
        let _inbox = self.inbox.lock().expect("poisoned lock");
        self.cond.notify_one();
    }
}

/// The body of one reactor thread.
pub(crate) fn run_loop(shared: Arc<ReactorShared>, reactor_index: usize, manager: Manager) {
    let mut cells: Vec<ActorCell> = Vec::new();
    let mut timers = TimerQueue::new();
    let mut run_queue: VecDeque<usize> = VecDeque::new();

    loop {
        // Wait for the next deadline or an external wake.
        let items: Vec<InboxItem> = {
            let mut inbox = shared.inbox.lock().expect("poisoned lock");
            if inbox.is_empty() && shared.is_running() {
                let now = Instant::now();
                match timers.next_deadline() {
                    Some(deadline) if deadline > now => {
                        let (guard, _) = shared
                            .cond
                            .wait_timeout(inbox, deadline.saturating_duration_since(now))
                            .expect("poisoned lock");
                        inbox = guard;
                    }
                    Some(_) => {
                        // A timer is already due; fall through.
                    }
                    None => {
                        inbox = shared.cond.wait(inbox).expect("poisoned lock");
                    }
                }
            }
            std::mem::take(&mut *inbox)
        };
        let running = shared.is_running();
        let now = Instant::now();

        // Drain the inbox into per-actor queues.
        for item in items {
            match item {
                InboxItem::Register {
                    slot,
                    generation,
                    actor,
                    start_event,
                } => {
                    if cells.len() <= slot {
                        cells.resize_with(slot + 1, ActorCell::vacant);
                    }
                    let cell = &mut cells[slot];
                    debug_assert_eq!(cell.state, CellState::Vacant);
                    cell.generation = generation;
                    cell.actor = Some(actor);
                    cell.pending.clear();
                    cell.pending.push_back(Pending::Event(start_event));
                    cell.state = CellState::Running;
                    enqueue_run(&mut cells[slot].queued, &mut run_queue, slot);
                    trace!(target: TARGET, reactor_index, slot, "actor registered");
                }
                InboxItem::Notify {
                    slot,
                    generation,
                    event,
                } => {
                    let deliverable = cells.get(slot).is_some_and(|cell| {
                        cell.state != CellState::Vacant && cell.generation == generation
                    });
                    if deliverable {
                        cells[slot].pending.push_back(Pending::Event(event));
                        enqueue_run(&mut cells[slot].queued, &mut run_queue, slot);
                    } else {
                        trace!(target: TARGET, reactor_index, slot, "dropping event for gone actor");
                    }
                }
            }
        }

        // Fire expired timers.
        while let Some((handle, slot)) = timers.pop_expired(now) {
            let deliverable = cells
                .get(slot)
                .is_some_and(|cell| cell.state != CellState::Vacant);
            if deliverable {
                cells[slot]
                    .pending
                    .push_back(Pending::Event(Event::with_data(EventKind::Timer, handle)));
                enqueue_run(&mut cells[slot].queued, &mut run_queue, slot);
            }
        }

        // Run every actor with pending work.
        while let Some(slot) = run_queue.pop_front() {
            cells[slot].queued = false;
            process_actor(
                slot,
                &mut cells,
                &mut timers,
                &shared,
                &manager,
                reactor_index,
                now,
            );
        }

        if !running {
            break;
        }
    }

    // Forced teardown of whatever is still registered.
    for slot in 0..cells.len() {
        if cells[slot].state != CellState::Vacant {
            finalize_actor(slot, &mut cells, &mut timers, &shared, &manager, reactor_index, None);
        }
    }
    trace!(target: TARGET, reactor_index, "reactor exiting");
}

/// Put `slot` on the run queue unless it is already there.
fn enqueue_run(queued: &mut bool, run_queue: &mut VecDeque<usize>, slot: usize) {
    if !*queued {
        *queued = true;
        run_queue.push_back(slot);
    }
}

/// Drain one actor's pending queue, FIFO, handling its stop marker.
#[allow(clippy::too_many_arguments)]
fn process_actor(
    slot: usize,
    cells: &mut Vec<ActorCell>,
    timers: &mut TimerQueue,
    shared: &ReactorShared,
    manager: &Manager,
    reactor_index: usize,
    now: Instant,
) {
    let Some(mut actor) = cells[slot].actor.take() else {
        return;
    };
    let actor_id = ActorId::new(ids::pack(reactor_index, slot), cells[slot].generation);
    loop {
        let Some(item) = cells[slot].pending.pop_front() else {
            break;
        };
        match item {
            Pending::Event(event) => {
                let mut ctx = ReactorContext {
                    now,
                    actor_id,
                    slot,
                    cells: &mut *cells,
                    timers: &mut *timers,
                    manager,
                    error: None,
                };
                actor.on_event(&mut ctx, event);
            }
            Pending::StopMarker {
                repost: true,
                finalizer,
            } => {
                // One extra round, so everything already queued (and
                // whatever those events post) drains before the end.
                cells[slot].pending.push_back(Pending::StopMarker {
                    repost: false,
                    finalizer,
                });
            }
            Pending::StopMarker {
                repost: false,
                finalizer,
            } => {
                cells[slot].actor = Some(actor);
                finalize_actor(slot, cells, timers, shared, manager, reactor_index, finalizer);
                return;
            }
        }
    }
    cells[slot].actor = Some(actor);
}

/// Deliver `Clear` for armed timers and the finalizer, then vacate the slot.
fn finalize_actor(
    slot: usize,
    cells: &mut Vec<ActorCell>,
    timers: &mut TimerQueue,
    shared: &ReactorShared,
    manager: &Manager,
    reactor_index: usize,
    finalizer: Option<Event>,
) {
    let Some(mut actor) = cells[slot].actor.take() else {
        return;
    };
    let actor_id = ActorId::new(ids::pack(reactor_index, slot), cells[slot].generation);
    let now = Instant::now();
    for handle in timers.cancel_all_for(slot) {
        let mut ctx = ReactorContext {
            now,
            actor_id,
            slot,
            cells: &mut *cells,
            timers: &mut *timers,
            manager,
            error: None,
        };
        actor.on_event(&mut ctx, Event::with_data(EventKind::Clear, handle));
    }
    if let Some(event) = finalizer {
        let mut ctx = ReactorContext {
            now,
            actor_id,
            slot,
            cells: &mut *cells,
            timers: &mut *timers,
            manager,
            error: None,
        };
        actor.on_event(&mut ctx, event);
    }
    // Timers armed during the farewell callbacks die with the actor.
    let _ = timers.cancel_all_for(slot);
    cells[slot] = ActorCell::vacant();
    shared.free_slot(slot);
    trace!(target: TARGET, reactor_index, slot, "actor gone");
}
