//! End-to-end actor lifecycle scenarios: delivery order, posting, stop
//! finalizers, timers, and cross-actor notification.

#![allow(clippy::unwrap_used)]

use std::sync::mpsc::{channel, Sender};
use std::time::{Duration, Instant};

use mprpc_base::{ActorId, Event, EventKind};
use mprpc_reactor::{Actor, ReactorContext, Scheduler, TimerHandle};

/// What the test actors report back to the test thread.
#[derive(Debug, PartialEq, Eq)]
enum Report {
    /// An event of the given kind arrived, with an optional `u32` payload.
    Saw(EventKind, Option<u32>),
    /// A timer fired.
    TimerFired,
    /// A timer was cleared by the reactor.
    TimerCleared,
}

/// An actor that reports every event it sees.
struct Recorder {
    /// Where reports go.
    sink: Sender<Report>,
    /// Stop as soon as a `Stop` event arrives.
    stop_on_stop: bool,
}

impl Actor for Recorder {
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, mut event: Event) {
        let payload = event.take_data::<u32>();
        self.sink.send(Report::Saw(event.kind(), payload)).unwrap();
        if self.stop_on_stop && event.kind() == EventKind::Stop {
            ctx.post_stop();
        }
    }
}

#[test]
fn events_arrive_in_submission_order() {
    let mut scheduler = Scheduler::start(2).unwrap();
    let (sink, reports) = channel();
    let id = scheduler
        .start_actor(
            Box::new(Recorder {
                sink,
                stop_on_stop: false,
            }),
            Event::start(),
        )
        .unwrap();

    let manager = scheduler.manager();
    for i in 1..=3_u32 {
        assert!(manager.notify(id, Event::with_data(EventKind::Raise, i)));
    }

    let timeout = Duration::from_secs(5);
    assert_eq!(
        reports.recv_timeout(timeout).unwrap(),
        Report::Saw(EventKind::Start, None)
    );
    for i in 1..=3_u32 {
        assert_eq!(
            reports.recv_timeout(timeout).unwrap(),
            Report::Saw(EventKind::Raise, Some(i))
        );
    }
    scheduler.stop();
}

#[test]
fn notify_fails_once_the_actor_is_gone() {
    let mut scheduler = Scheduler::start(1).unwrap();
    let (sink, reports) = channel();
    let id = scheduler
        .start_actor(
            Box::new(Recorder {
                sink,
                stop_on_stop: true,
            }),
            Event::start(),
        )
        .unwrap();
    let manager = scheduler.manager();

    assert_eq!(
        reports.recv_timeout(Duration::from_secs(5)).unwrap(),
        Report::Saw(EventKind::Start, None)
    );
    assert!(manager.notify(id, Event::stop()));

    // The actor tears itself down; eventually notify must say so.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if !manager.notify(id, Event::new(EventKind::Raise)) {
            break;
        }
        assert!(Instant::now() < deadline, "actor never exited");
        std::thread::sleep(Duration::from_millis(5));
    }
    // A fabricated id was never registered.
    assert!(!manager.notify(ActorId::invalid(), Event::default()));
    scheduler.stop();
}

/// An actor that exercises post ordering and the stop finalizer.
struct PostAndStop {
    /// Where reports go.
    sink: Sender<Report>,
}

impl Actor for PostAndStop {
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, mut event: Event) {
        let payload = event.take_data::<u32>();
        self.sink.send(Report::Saw(event.kind(), payload)).unwrap();
        if event.kind() == EventKind::Start {
            ctx.post(Event::with_data(EventKind::Message, 1_u32));
            ctx.post_stop_with(Event::with_data(EventKind::Kill, 99_u32));
            // Posted after the stop request: must still be delivered
            // before the finalizer.
            ctx.post(Event::with_data(EventKind::Message, 2_u32));
        }
    }
}

#[test]
fn stop_finalizer_runs_after_in_flight_posts_drain() {
    let mut scheduler = Scheduler::start(1).unwrap();
    let (sink, reports) = channel();
    scheduler
        .start_actor(Box::new(PostAndStop { sink }), Event::start())
        .unwrap();

    let timeout = Duration::from_secs(5);
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(reports.recv_timeout(timeout).unwrap());
    }
    assert_eq!(
        seen,
        vec![
            Report::Saw(EventKind::Start, None),
            Report::Saw(EventKind::Message, Some(1)),
            Report::Saw(EventKind::Message, Some(2)),
            Report::Saw(EventKind::Kill, Some(99)),
        ]
    );
    // Nothing after the finalizer.
    assert!(reports.recv_timeout(Duration::from_millis(200)).is_err());
    scheduler.stop();
}

/// An actor that arms two timers, cancels one, and stops with one pending.
struct TimerUser {
    /// Where reports go.
    sink: Sender<Report>,
    /// The long timer armed at start, canceled on the first fire.
    long_timer: TimerHandle,
}

impl Actor for TimerUser {
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, event: Event) {
        match event.kind() {
            EventKind::Start => {
                let short = ctx.add_timer(ctx.now() + Duration::from_millis(20));
                let canceled = ctx.add_timer(ctx.now() + Duration::from_millis(40));
                // An immediately-canceled timer must never fire.
                assert!(ctx.rem_timer(canceled));
                // Left pending; surfaces as Clear on teardown.
                self.long_timer = ctx.add_timer(ctx.now() + Duration::from_secs(3600));
                let _ = short;
            }
            EventKind::Timer => {
                self.sink.send(Report::TimerFired).unwrap();
                ctx.post_stop();
            }
            EventKind::Clear => {
                let handle = event.data::<TimerHandle>().copied().unwrap();
                assert_eq!(handle, self.long_timer);
                self.sink.send(Report::TimerCleared).unwrap();
            }
            _ => {}
        }
    }
}

#[test]
fn timers_fire_cancel_and_clear() {
    let mut scheduler = Scheduler::start(1).unwrap();
    let (sink, reports) = channel();
    scheduler
        .start_actor(
            Box::new(TimerUser {
                sink,
                long_timer: TimerHandle::invalid(),
            }),
            Event::start(),
        )
        .unwrap();

    let timeout = Duration::from_secs(5);
    assert_eq!(reports.recv_timeout(timeout).unwrap(), Report::TimerFired);
    assert_eq!(reports.recv_timeout(timeout).unwrap(), Report::TimerCleared);
    // The canceled timer never fires.
    assert!(reports.recv_timeout(Duration::from_millis(200)).is_err());
    scheduler.stop();
}

/// An actor that relays every `Raise` it receives to a peer.
struct Forwarder {
    /// Who to forward to.
    peer: ActorId,
}

impl Actor for Forwarder {
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, mut event: Event) {
        if event.kind() == EventKind::Raise {
            let payload = event.take_data::<u32>().unwrap();
            assert!(ctx
                .manager()
                .notify(self.peer, Event::with_data(EventKind::Raise, payload + 1)));
        }
    }
}

#[test]
fn actors_notify_each_other_across_reactors() {
    let mut scheduler = Scheduler::start(2).unwrap();
    let (sink, reports) = channel();
    let receiver = scheduler
        .start_actor(
            Box::new(Recorder {
                sink,
                stop_on_stop: false,
            }),
            Event::start(),
        )
        .unwrap();
    let forwarder = scheduler
        .start_actor(Box::new(Forwarder { peer: receiver }), Event::start())
        .unwrap();

    let manager = scheduler.manager();
    assert!(manager.notify(forwarder, Event::with_data(EventKind::Raise, 41_u32)));

    let timeout = Duration::from_secs(5);
    assert_eq!(
        reports.recv_timeout(timeout).unwrap(),
        Report::Saw(EventKind::Start, None)
    );
    assert_eq!(
        reports.recv_timeout(timeout).unwrap(),
        Report::Saw(EventKind::Raise, Some(42))
    );
    scheduler.stop();
}
