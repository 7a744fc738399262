//! How the engine wakes connections.

use mprpc_base::{ActorId, Event, EventKind};
use mprpc_reactor::Manager;

/// Why a connection is being woken.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum RelayNotification {
    /// The connection's writer has new chunks to pull with
    /// [`poll_new`](crate::RelayEngine::poll_new).
    NewData,
    /// The connection's writer has buffers to reclaim or cancellations to
    /// learn about with [`poll_done`](crate::RelayEngine::poll_done).
    DoneData,
}

/// The engine's route to a connection's actor.
///
/// Implementations MUST NOT block: the engine calls this with its own lock
/// held.  Spurious wake-ups at the connection are tolerated; a lost wake-up
/// is not, so implementations must either queue the notification or report
/// the actor gone by returning false.
pub trait ConnectionNotifier: Send + Sync + 'static {
    /// Wake the actor behind `actor_id`.  False iff the actor is gone.
    fn notify_connection(&self, actor_id: ActorId, what: RelayNotification) -> bool;
}

/// The production wiring: notifications become `Raise` events posted
/// through the reactor substrate, payload-typed [`RelayNotification`].
impl ConnectionNotifier for Manager {
    fn notify_connection(&self, actor_id: ActorId, what: RelayNotification) -> bool {
        self.notify(actor_id, Event::with_data(EventKind::Raise, what))
    }
}
