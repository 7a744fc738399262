//! The production notification path: engine → reactor manager → connection
//! actor.

#![allow(clippy::unwrap_used)]

use std::sync::mpsc::{channel, Sender};
use std::time::Duration;

use bytes::Bytes;

use mprpc_base::{Event, EventKind, UniqueId};
use mprpc_proto::{MessageFlags, MessageHeader, RelayName, RequestId};
use mprpc_reactor::{Actor, ReactorContext, Scheduler};
use mprpc_relay::{MessageId, RelayData, RelayEngine, RelayNotification};

/// A connection actor that reports every relay notification it receives.
struct Connection {
    /// Where notifications go.
    sink: Sender<RelayNotification>,
}

impl Actor for Connection {
    fn on_event(&mut self, _ctx: &mut ReactorContext<'_>, event: Event) {
        if event.kind() == EventKind::Raise {
            if let Some(what) = event.data::<RelayNotification>() {
                self.sink.send(*what).unwrap();
            }
        }
    }
}

#[test]
fn engine_notifications_reach_connection_actors() {
    let mut scheduler = Scheduler::start(2).unwrap();
    let engine = RelayEngine::new(scheduler.manager());

    let (b_sink, b_reports) = channel();
    let actor_b = scheduler
        .start_actor(Box::new(Connection { sink: b_sink }), Event::start())
        .unwrap();
    let (a_sink, a_reports) = channel();
    let actor_a = scheduler
        .start_actor(Box::new(Connection { sink: a_sink }), Event::start())
        .unwrap();

    // Registration wakes the registrant once.
    let mut b_id = UniqueId::invalid();
    engine.register_connection(actor_b, &mut b_id, 2, 0);
    let timeout = Duration::from_secs(5);
    assert_eq!(
        b_reports.recv_timeout(timeout).unwrap(),
        RelayNotification::NewData
    );

    // A relayed message wakes the receiver's actor with NewData…
    let mut a_id = UniqueId::invalid();
    engine.register_connection(actor_a, &mut a_id, 1, 0);
    assert_eq!(
        a_reports.recv_timeout(timeout).unwrap(),
        RelayNotification::NewData
    );

    let mut header = MessageHeader::new(RelayName::new(2, 0), MessageFlags::empty());
    header.set_recipient_request_id(RequestId::new(4, 0));
    let mut msg_id = MessageId::invalid();
    engine
        .relay_start(
            actor_a,
            &mut a_id,
            header,
            RelayData::last(Bytes::from_static(b"ping")),
            &mut msg_id,
        )
        .unwrap();
    assert_eq!(
        b_reports.recv_timeout(timeout).unwrap(),
        RelayNotification::NewData
    );

    // …and completing a chunk wakes the sender's actor with DoneData.
    let mut pulled = Vec::new();
    engine
        .poll_new(b_id, &mut |chunk| {
            pulled.push(chunk);
            mprpc_relay::PushResult {
                accepted: true,
                can_take_more: true,
                receiver_msg_id: None,
            }
        })
        .unwrap();
    assert_eq!(pulled.len(), 1);
    engine.complete(b_id, pulled.pop().unwrap()).unwrap();
    assert_eq!(
        a_reports.recv_timeout(timeout).unwrap(),
        RelayNotification::DoneData
    );

    engine.stop_connection(a_id);
    engine.stop_connection(b_id);
    scheduler.stop();
}
