//! Events delivered to actors.
//!
//! An [`Event`] is the unit of communication between the outside world and an
//! actor: reactors post them, managers route them, actors consume them in
//! their `on_event` callback.  An event is a well-known [`EventKind`] plus an
//! optional boxed payload; the payload is opaque to everything but the final
//! consumer, which downcasts it back to the concrete type it expects.

use std::any::Any;
use std::fmt;

/// Well-known kinds of [`Event`].
///
/// The kinds here are the vocabulary the framework itself uses; applications
/// are free to hang whatever payload they like off [`EventKind::Message`] or
/// [`EventKind::Raise`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum EventKind {
    /// An event with no particular meaning.
    Default,
    /// First event an actor sees after registration.
    Start,
    /// Orderly-teardown request.
    Stop,
    /// Cross-thread wake-up carrying a payload for the actor.
    Raise,
    /// Application-level message.
    Message,
    /// A timer owned by the actor has fired.
    Timer,
    /// The owning reactor is discarding per-actor resources; delivered to a
    /// completion handler before it is forcibly unregistered.
    Clear,
    /// Unconditional-teardown request.
    Kill,
}

/// A unit of work delivered to an actor.
pub struct Event {
    /// What sort of event this is.
    kind: EventKind,
    /// Optional payload, downcast by the consumer.
    data: Option<Box<dyn Any + Send>>,
}

impl Event {
    /// Return a payload-free event of the given kind.
    pub fn new(kind: EventKind) -> Self {
        Event { kind, data: None }
    }

    /// Return an event of the given kind carrying `data`.
    pub fn with_data<T: Any + Send>(kind: EventKind, data: T) -> Self {
        Event {
            kind,
            data: Some(Box::new(data)),
        }
    }

    /// Return a [`EventKind::Start`] event.
    pub fn start() -> Self {
        Event::new(EventKind::Start)
    }

    /// Return a [`EventKind::Stop`] event.
    pub fn stop() -> Self {
        Event::new(EventKind::Stop)
    }

    /// Return a [`EventKind::Kill`] event.
    pub fn kill() -> Self {
        Event::new(EventKind::Kill)
    }

    /// Return this event's kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Return a reference to the payload, if it exists and has type `T`.
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.as_deref().and_then(|d| d.downcast_ref())
    }

    /// Take the payload out of this event, if it exists and has type `T`.
    ///
    /// A payload of a different type is left in place.
    pub fn take_data<T: Any>(&mut self) -> Option<T> {
        if self.data.as_deref().is_some_and(|d| d.is::<T>()) {
            self.data
                .take()
                .and_then(|d| d.downcast().ok())
                .map(|d| *d)
        } else {
            None
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new(EventKind::Default)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn payload_roundtrip() {
        let mut ev = Event::with_data(EventKind::Message, 42_u32);
        assert_eq!(ev.kind(), EventKind::Message);
        assert_eq!(ev.data::<u32>(), Some(&42));
        // Wrong type: payload untouched.
        assert_eq!(ev.take_data::<String>(), None);
        assert_eq!(ev.take_data::<u32>(), Some(42));
        // Payload is gone now.
        assert_eq!(ev.take_data::<u32>(), None);
    }

    #[test]
    fn payload_free() {
        let mut ev = Event::start();
        assert_eq!(ev.kind(), EventKind::Start);
        assert_eq!(ev.data::<u32>(), None);
        assert_eq!(ev.take_data::<u32>(), None);
    }
}
