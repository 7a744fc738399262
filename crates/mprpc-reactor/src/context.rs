//! The context threaded through every actor callback.

use std::time::Instant;

use mprpc_base::{ActorId, Event};

use crate::reactor::{ActorCell, CellState, Pending};
use crate::scheduler::Manager;
use crate::timer_queue::{TimerHandle, TimerQueue};
use crate::Error;

/// Everything an actor may touch from inside a callback.
///
/// A fresh context is built for every delivered event; the error slot in
/// particular does not survive from one callback to the next.  There is no
/// other way to reach the reactor: the context is an explicit argument
/// everywhere rather than thread-local state.
pub struct ReactorContext<'a> {
    /// Time captured once per loop turn.
    pub(crate) now: Instant,
    /// Id of the actor being called.
    pub(crate) actor_id: ActorId,
    /// Slot of the actor being called.
    pub(crate) slot: usize,
    /// All actor cells of this reactor; the current actor's cell has its
    /// actor taken out, but its queue and state are live.
    pub(crate) cells: &'a mut Vec<ActorCell>,
    /// This reactor's timer queue.
    pub(crate) timers: &'a mut TimerQueue,
    /// Cross-thread face of the whole scheduler.
    pub(crate) manager: &'a Manager,
    /// Clearable per-callback error slot.
    pub(crate) error: Option<Error>,
}

impl ReactorContext<'_> {
    /// Return the time captured at the start of this loop turn.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Return the id of the current actor.
    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    /// Return the manager, for raising events at other actors.
    pub fn manager(&self) -> &Manager {
        self.manager
    }

    /// Schedule `event` for the current actor, after everything it already
    /// has queued.  Delivery order among posts is FIFO.
    pub fn post(&mut self, event: Event) {
        self.cells[self.slot].pending.push_back(Pending::Event(event));
    }

    /// Ask for teardown of the current actor.
    ///
    /// Events already queued still drain first.  Repeated requests are
    /// ignored.
    pub fn post_stop(&mut self) {
        self.do_post_stop(None);
    }

    /// Ask for teardown, delivering `finalizer` as the very last event.
    pub fn post_stop_with(&mut self, finalizer: Event) {
        self.do_post_stop(Some(finalizer));
    }

    /// Common part of the stop requests.
    fn do_post_stop(&mut self, finalizer: Option<Event>) {
        let cell = &mut self.cells[self.slot];
        if cell.state != CellState::Running {
            return;
        }
        cell.state = CellState::Stopping;
        // The marker reposts itself once, so that everything posted up to
        // the moment it is first seen still drains beforehand.
        cell.pending.push_back(Pending::StopMarker {
            repost: true,
            finalizer,
        });
    }

    /// Arm a steady timer for the current actor.
    ///
    /// When it expires the actor receives a `Timer` event whose payload is
    /// the returned [`TimerHandle`].
    pub fn add_timer(&mut self, deadline: Instant) -> TimerHandle {
        self.timers.add(deadline, self.slot)
    }

    /// Disarm a timer.  A stale handle (already fired, already removed) is
    /// a silent no-op; returns whether a timer was actually disarmed.
    pub fn rem_timer(&mut self, handle: TimerHandle) -> bool {
        self.timers.remove(handle)
    }

    /// Return the error recorded for this callback, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Record an error for this callback.
    pub fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    /// Clear the error slot.
    pub fn clear_error(&mut self) {
        self.error = None;
    }
}
