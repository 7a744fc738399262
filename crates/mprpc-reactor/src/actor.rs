//! The actor trait.

use mprpc_base::Event;

use crate::ReactorContext;

/// An event-driven unit scheduled on one reactor.
///
/// All of an actor's callbacks run on the reactor it was registered on, one
/// at a time, so implementations need no internal locking.  The first event
/// an actor sees is the start event passed to
/// [`Scheduler::start_actor`](crate::Scheduler::start_actor); after it asks
/// for teardown with [`ReactorContext::post_stop`], events already queued
/// still drain, its armed timers are surfaced as `Clear` events, the
/// optional finalizer event runs last, and nothing is delivered after that.
pub trait Actor: Send + 'static {
    /// Handle one event.
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, event: Event);
}
