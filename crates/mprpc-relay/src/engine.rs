//! The relay engine proper.
//!
//! One mutex guards every pool and list: messages cross-reference two
//! connections each, connections list many messages, and the free lists
//! thread through both pools, so per-record locking would deadlock before
//! it paid for itself.  Every operation is short (pointer surgery plus at
//! most one notification), and notifications are posted under the lock,
//! which is sound because [`ConnectionNotifier`] implementations never
//! block.
//!
//! Message flow, one direction per line, writers on the outside:
//!
//! ```text
//! W1 ---> RR --> RW ---> R2      (request bytes)
//! R1 <--- RW <-- RR <--- W2      (response bytes)
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tracing::{trace, warn};

use mprpc_base::inner_list::NIL;
use mprpc_base::{ActorId, UniqueId};
use mprpc_proto::{MessageFlags, MessageHeader, RelayName};

use crate::notifier::{ConnectionNotifier, RelayNotification};
use crate::relay_data::{RelayChunk, RelayData};
use crate::stubs::{ConnectionStub, MessageState, MessageStub, RelayDataStub};
use crate::{Error, MessageId, Result};

/// Log target for this module.
const TARGET: &str = "mprpc_relay::engine";

/// Outcome the receiving connection's writer reports for one chunk
/// offered through [`RelayEngine::poll_new`].
#[derive(Clone, Copy, Debug)]
#[allow(clippy::exhaustive_structs)] // constructed by every writer
pub struct PushResult {
    /// True if the writer took the chunk; it now owes a
    /// [`complete`](RelayEngine::complete) for it (cancel markers excepted;
    /// the engine retires those itself).
    pub accepted: bool,
    /// True if the writer could take a chunk of another message too.
    pub can_take_more: bool,
    /// The handle the writer wants recorded as its own bookkeeping id for
    /// this message, echoed back in later chunks.
    pub receiver_msg_id: Option<MessageId>,
}

/// Everything the engine mutates, under the one lock.
struct EngineData {
    /// Message records.
    msgs: Vec<MessageStub>,
    /// Free list of message records, threaded through the send-link family
    /// (a cached message is on nobody's send list).
    msg_cache: crate::stubs::SendList,
    /// Relay-data records.
    rds: Vec<RelayDataStub>,
    /// Head of the relay-data free stack, chained through `next`.
    rd_free_top: usize,
    /// Connection records.
    cons: Vec<ConnectionStub>,
    /// Free connection slots.
    con_cache: Vec<usize>,
    /// Name lookup for receivers.
    names: HashMap<RelayName, usize>,
}

impl EngineData {
    /// Return an empty data block.
    fn new() -> Self {
        EngineData {
            msgs: Vec::new(),
            msg_cache: crate::stubs::SendList::new(),
            rds: Vec::new(),
            rd_free_top: NIL,
            cons: Vec::new(),
            con_cache: Vec::new(),
            names: HashMap::new(),
        }
    }

    /// Resolve a connection id to its slot, or learn that it is stale.
    fn con_index(&self, id: UniqueId) -> Result<usize> {
        let index = id.index() as usize;
        match self.cons.get(index) {
            Some(con) if id.is_valid() && con.unique == id.generation() => Ok(index),
            _ => Err(Error::StaleConnection),
        }
    }

    /// Resolve a message id to its slot, or learn that it is stale.
    fn msg_index(&self, id: MessageId) -> Result<usize> {
        let index = id.index() as usize;
        match self.msgs.get(index) {
            Some(msg) if id.is_valid() && msg.unique == id.generation() => Ok(index),
            _ => Err(Error::StaleMessage),
        }
    }

    /// Take a relay-data record for `data`, reusing a cached slot if any.
    fn create_rd(&mut self, data: RelayData) -> usize {
        if self.rd_free_top != NIL {
            let index = self.rd_free_top;
            self.rd_free_top = self.rds[index].next;
            self.rds[index] = RelayDataStub::new(data);
            index
        } else {
            self.rds.push(RelayDataStub::new(data));
            self.rds.len() - 1
        }
    }

    /// Return a relay-data record to the free stack, dropping whatever it
    /// still holds.
    fn free_rd(&mut self, index: usize) {
        self.rds[index] = RelayDataStub::default();
        self.rds[index].next = self.rd_free_top;
        self.rd_free_top = index;
    }

    /// Take a message record, reusing a cached slot if any.
    fn create_message(&mut self) -> usize {
        let EngineData {
            msgs, msg_cache, ..
        } = self;
        if let Some(index) = msg_cache.pop_back(msgs) {
            index
        } else {
            msgs.push(MessageStub::default());
            msgs.len() - 1
        }
    }

    /// Clear a message record and cache it.  Its generation bumps, so
    /// every id pointing at it goes stale.
    fn free_message(&mut self, index: usize) {
        self.msgs[index].clear();
        let EngineData {
            msgs, msg_cache, ..
        } = self;
        msg_cache.push_back(msgs, index);
    }

    /// Take a connection record, reusing a cached slot if any.
    fn create_connection(&mut self) -> usize {
        if let Some(index) = self.con_cache.pop() {
            index
        } else {
            self.cons.push(ConnectionStub::default());
            self.cons.len() - 1
        }
    }

    /// Clear a connection record and cache it.
    fn free_connection(&mut self, index: usize) {
        self.cons[index].clear();
        self.con_cache.push(index);
    }

    /// Append a relay-data record to a message's FIFO.
    fn msg_push_rd(&mut self, msgidx: usize, rdidx: usize) {
        self.rds[rdidx].next = NIL;
        let msg = &mut self.msgs[msgidx];
        if msg.back != NIL {
            let old_back = msg.back;
            msg.back = rdidx;
            self.rds[old_back].next = rdidx;
        } else {
            msg.front = rdidx;
            msg.back = rdidx;
        }
    }

    /// Detach and return the head of a message's FIFO.
    fn msg_pop_rd(&mut self, msgidx: usize) -> Option<usize> {
        let msg = &mut self.msgs[msgidx];
        if msg.front == NIL {
            return None;
        }
        let index = msg.front;
        msg.front = self.rds[index].next;
        if msg.front == NIL {
            msg.back = NIL;
        }
        self.rds[index].next = NIL;
        Some(index)
    }

    /// Append a relay-data record to a connection's done queue.
    ///
    /// The queue is drained front-first, so buffers come back to the
    /// sender in the order the receiver completed them.
    fn done_push(&mut self, conidx: usize, rdidx: usize) {
        self.rds[rdidx].next = NIL;
        let con = &mut self.cons[conidx];
        if con.done_back != NIL {
            let old_back = con.done_back;
            con.done_back = rdidx;
            self.rds[old_back].next = rdidx;
        } else {
            con.done_front = rdidx;
            con.done_back = rdidx;
        }
    }

    /// Find the connection registered under `name`, or create a
    /// placeholder stub (no actor yet) that a later registration adopts.
    fn resolve_name(&mut self, name: RelayName) -> usize {
        if let Some(&index) = self.names.get(&name) {
            return index;
        }
        let index = self.create_connection();
        self.cons[index].name = Some(name);
        self.names.insert(name, index);
        index
    }

    // Split-borrow helpers: a connection's message lists thread through
    // the message pool, so every list operation needs both fields at once.

    /// Detach the front of a connection's recv list.
    fn recv_pop_front(&mut self, conidx: usize) -> Option<usize> {
        let EngineData { msgs, cons, .. } = self;
        cons[conidx].recv_list.pop_front(msgs)
    }

    /// Detach a message from a connection's recv list.
    fn recv_erase(&mut self, conidx: usize, msgidx: usize) {
        let EngineData { msgs, cons, .. } = self;
        cons[conidx].recv_list.erase(msgs, msgidx);
    }

    /// Append a message to a connection's recv list.
    fn recv_push_back(&mut self, conidx: usize, msgidx: usize) {
        let EngineData { msgs, cons, .. } = self;
        cons[conidx].recv_list.push_back(msgs, msgidx);
    }

    /// Prepend a message to a connection's recv list.
    fn recv_push_front(&mut self, conidx: usize, msgidx: usize) {
        let EngineData { msgs, cons, .. } = self;
        cons[conidx].recv_list.push_front(msgs, msgidx);
    }

    /// Detach the front of a connection's send list.
    fn send_pop_front(&mut self, conidx: usize) -> Option<usize> {
        let EngineData { msgs, cons, .. } = self;
        cons[conidx].send_list.pop_front(msgs)
    }

    /// Detach a message from a connection's send list.
    fn send_erase(&mut self, conidx: usize, msgidx: usize) {
        let EngineData { msgs, cons, .. } = self;
        cons[conidx].send_list.erase(msgs, msgidx);
    }

    /// Append a message to a connection's send list.
    fn send_push_back(&mut self, conidx: usize, msgidx: usize) {
        let EngineData { msgs, cons, .. } = self;
        cons[conidx].send_list.push_back(msgs, msgidx);
    }

    /// Prepend a message to a connection's send list.
    fn send_push_front(&mut self, conidx: usize, msgidx: usize) {
        let EngineData { msgs, cons, .. } = self;
        cons[conidx].send_list.push_front(msgs, msgidx);
    }

    /// True if the back of a connection's recv list has pullable data,
    /// the "writer should poll again" signal.
    fn recv_back_has_data(&self, conidx: usize) -> bool {
        self.cons[conidx]
            .recv_list
            .back(&self.msgs)
            .is_some_and(MessageStub::has_data)
    }

    /// The storm filter for `NewData`: skip notifying when the ready queue
    /// already ends in a message with data (modulo `msgidx`, which the
    /// caller is about to move there itself).
    fn should_notify_new(&self, conidx: usize, msgidx: Option<usize>) -> bool {
        let recv = &self.cons[conidx].recv_list;
        match recv.back_index() {
            None => true,
            Some(back) => Some(back) == msgidx || !self.msgs[back].has_data(),
        }
    }

    /// The storm filter for `DoneData` on a receiver-side cancellation:
    /// skip notifying when the send list already leads with another
    /// cancellation the writer has yet to see.
    fn should_notify_recv_cancel(&self, conidx: usize, msgidx: usize) -> bool {
        let send = &self.cons[conidx].send_list;
        match send.front_index() {
            None => true,
            Some(front) => front == msgidx || self.msgs[front].state != MessageState::RecvCancel,
        }
    }
}

/// The broker forwarding framed message chunks between connections.
///
/// `N` is the route to connection actors; production wiring uses the
/// reactor [`Manager`](mprpc_reactor::Manager), tests use whatever records
/// calls.
pub struct RelayEngine<N> {
    /// How connections get woken.
    notifier: N,
    /// All mutable state.
    data: Mutex<EngineData>,
}

impl<N: ConnectionNotifier> RelayEngine<N> {
    /// Return a new engine that wakes connections through `notifier`.
    pub fn new(notifier: N) -> Self {
        RelayEngine {
            notifier,
            data: Mutex::new(EngineData::new()),
        }
    }

    /// Wake a connection actor, tolerating placeholders (invalid id).
    fn notify(&self, actor_id: ActorId, what: RelayNotification) {
        if actor_id.is_invalid() {
            return;
        }
        let alive = self.notifier.notify_connection(actor_id, what);
        debug_assert!(alive, "relay notification target should be alive");
        if !alive {
            warn!(target: TARGET, %actor_id, ?what, "dropping notification for vanished connection");
        }
    }

    /// Open a new relayed message.
    ///
    /// Called by the sending connection's reader with the message's first
    /// chunk.  `relay_con_id` is the caller's engine handle: invalid on the
    /// first call ever, in which case the engine registers the caller
    /// unnamed and writes the new handle back.  The destination is resolved
    /// from the header's name, creating a placeholder if nothing has
    /// registered under it yet.  On success `msg_id` holds the engine's
    /// handle for the message, to be quoted by every later chunk.
    pub fn relay_start(
        &self,
        sender_actor: ActorId,
        relay_con_id: &mut UniqueId,
        mut header: MessageHeader,
        mut data: RelayData,
        msg_id: &mut MessageId,
    ) -> Result<()> {
        debug_assert!(sender_actor.is_valid());
        let mut guard = self.data.lock().expect("poisoned lock");
        let d = &mut *guard;

        let snd_conidx = if relay_con_id.is_valid() {
            d.con_index(*relay_con_id)?
        } else {
            let conidx = d.create_connection();
            d.cons[conidx].actor_id = sender_actor;
            *relay_con_id = UniqueId::new(conidx as u64, d.cons[conidx].unique);
            conidx
        };

        let msgidx = d.create_message();
        {
            let msg = &mut d.msgs[msgidx];
            msg.state = MessageState::Relay;
            msg.last_message_flags = header.flags();
            // The reader already swapped the ids off the wire; swap again
            // so the stub header parks the requester's id in the sender
            // slot for the response to pick up.
            header.swap_request_ids();
            msg.header = header;
            *msg_id = MessageId::new(msgidx as u64, msg.unique);
        }

        let name = d.msgs[msgidx].header.name();
        let rcv_conidx = d.resolve_name(name);
        d.msgs[msgidx].sender_con_id = UniqueId::new(snd_conidx as u64, d.cons[snd_conidx].unique);
        d.msgs[msgidx].receiver_con_id =
            UniqueId::new(rcv_conidx as u64, d.cons[rcv_conidx].unique);

        d.send_push_back(snd_conidx, msgidx);

        data.set_first();
        data.set_message_flags(d.msgs[msgidx].header.flags());
        let rdidx = d.create_rd(data);
        d.msg_push_rd(msgidx, rdidx);

        let should_notify = d.should_notify_new(rcv_conidx, None);
        d.recv_push_back(rcv_conidx, msgidx);

        trace!(
            target: TARGET,
            relay_con_id = %relay_con_id,
            msg_id = %msg_id,
            receiver = rcv_conidx,
            "relay start"
        );

        if should_notify {
            self.notify(d.cons[rcv_conidx].actor_id, RelayNotification::NewData);
        }
        Ok(())
    }

    /// Append more bytes to an existing message.
    ///
    /// Called by the sending connection's reader for every chunk after the
    /// first.  A message whose receiver has already canceled still accepts
    /// chunks; their buffers ride back to the caller with the pending
    /// cancel through [`poll_done`](Self::poll_done).
    pub fn relay(&self, relay_con_id: UniqueId, data: RelayData, msg_id: MessageId) -> Result<()> {
        let mut guard = self.data.lock().expect("poisoned lock");
        let d = &mut *guard;
        let conidx = d.con_index(relay_con_id)?;
        let msgidx = d.msg_index(msg_id)?;

        match d.msgs[msgidx].state {
            MessageState::Relay => {
                self.push_more_data(d, msgidx, data);
                Ok(())
            }
            MessageState::RecvCancel => {
                // Queued onto the dead message; poll_done returns the
                // buffer together with the cancellation.
                let mut data = data;
                data.set_message_flags(d.msgs[msgidx].last_message_flags);
                let rdidx = d.create_rd(data);
                d.msg_push_rd(msgidx, rdidx);
                trace!(target: TARGET, %relay_con_id, %msg_id, "relay onto canceled message");
                Ok(())
            }
            MessageState::SendCancel | MessageState::WaitResponse | MessageState::Cache => {
                // Not a legal state to extend; give the buffer straight
                // back through the caller's own done queue.
                debug_assert!(d.msgs[msgidx].state != MessageState::Cache);
                let should_notify = d.cons[conidx].done_is_empty();
                let rdidx = d.create_rd(data);
                d.done_push(conidx, rdidx);
                if should_notify {
                    self.notify(d.cons[conidx].actor_id, RelayNotification::DoneData);
                }
                Err(Error::MessageCanceled)
            }
        }
    }

    /// Common tail of [`relay`](Self::relay) and streamed response parts:
    /// append the chunk and re-ready the message on its receiver.
    fn push_more_data(&self, d: &mut EngineData, msgidx: usize, mut data: RelayData) {
        let was_empty = d.msgs[msgidx].front == NIL;
        data.set_message_flags(d.msgs[msgidx].last_message_flags);
        let rdidx = d.create_rd(data);
        d.msg_push_rd(msgidx, rdidx);

        if was_empty {
            // The message had gone quiet; move it to the back of the ready
            // queue so the writer reaches it again.
            let rcv_id = d.msgs[msgidx].receiver_con_id;
            debug_assert!(rcv_id.is_valid());
            let rcv_conidx = rcv_id.index() as usize;
            debug_assert!(!d.cons[rcv_conidx].recv_list.is_empty());
            let should_notify = d.should_notify_new(rcv_conidx, Some(msgidx));
            d.recv_erase(rcv_conidx, msgidx);
            d.recv_push_back(rcv_conidx, msgidx);
            if should_notify {
                self.notify(d.cons[rcv_conidx].actor_id, RelayNotification::NewData);
            }
        }
    }

    /// Send the response for a previously relayed request.
    ///
    /// Called by the original *receiver*'s reader.  On the first response
    /// chunk the stub's endpoints swap (the receiver becomes the sender),
    /// the request ids swap back so the original requester can match the
    /// response to its pending request, and the message rejoins both
    /// connections' lists in its mirrored roles.  Later parts of a
    /// multi-part response take the plain relay path.
    pub fn relay_response(
        &self,
        relay_con_id: UniqueId,
        mut header: MessageHeader,
        mut data: RelayData,
        msg_id: MessageId,
    ) -> Result<()> {
        let mut guard = self.data.lock().expect("poisoned lock");
        let d = &mut *guard;
        let conidx = d.con_index(relay_con_id)?;
        let msgidx = d.msg_index(msg_id)?;

        data.set_first();
        data.set_message_flags(header.flags());
        d.msgs[msgidx].last_message_flags = header.flags();

        match d.msgs[msgidx].state {
            MessageState::WaitResponse => {
                debug_assert!(d.msgs[msgidx].sender_con_id.is_valid());
                debug_assert!(d.msgs[msgidx].receiver_con_id.is_valid());
                debug_assert!(d.msgs[msgidx].front == NIL);

                // The requester's own id was parked in the stub header by
                // relay_start; after the swap below, planting it in the
                // sender slot is what routes the response completion back
                // to the requester's pending request.
                let requester_id = d.msgs[msgidx].header.sender_request_id();

                {
                    let msg = &mut d.msgs[msgidx];
                    msg.receiver_msg_id.clear();
                    std::mem::swap(&mut msg.receiver_con_id, &mut msg.sender_con_id);
                    header.swap_request_ids();
                    header.set_sender_request_id(requester_id);
                    msg.header = header;
                    msg.state = MessageState::Relay;
                }

                let rdidx = d.create_rd(data);
                d.msg_push_rd(msgidx, rdidx);

                let rcv_conidx = d.msgs[msgidx].receiver_con_id.index() as usize;
                let snd_conidx = d.msgs[msgidx].sender_con_id.index() as usize;
                debug_assert_eq!(snd_conidx, conidx);
                debug_assert!(d.cons[rcv_conidx].unique == d.msgs[msgidx].receiver_con_id.generation());

                let should_notify = d.should_notify_new(rcv_conidx, None);

                // Out of the old roles' lists, into the mirrored ones.
                d.recv_erase(snd_conidx, msgidx);
                d.send_erase(rcv_conidx, msgidx);
                d.send_push_back(snd_conidx, msgidx);
                d.recv_push_back(rcv_conidx, msgidx);

                trace!(target: TARGET, %relay_con_id, %msg_id, "relay response");

                if should_notify {
                    self.notify(d.cons[rcv_conidx].actor_id, RelayNotification::NewData);
                }
                Ok(())
            }
            MessageState::Relay => {
                // Another part of a multi-part response.
                self.push_more_data(d, msgidx, data);
                Ok(())
            }
            MessageState::RecvCancel | MessageState::SendCancel | MessageState::Cache => {
                debug_assert!(d.msgs[msgidx].state != MessageState::Cache);
                let should_notify = d.cons[conidx].done_is_empty();
                let rdidx = d.create_rd(data);
                d.done_push(conidx, rdidx);
                if should_notify {
                    self.notify(d.cons[conidx].actor_id, RelayNotification::DoneData);
                }
                Err(Error::MessageCanceled)
            }
        }
    }

    /// Pull queued chunks for the receiving connection's writer.
    ///
    /// Walks the ready queue from the back (where freshly readied messages
    /// sit) toward the front, offering each message's front chunk to
    /// `try_push` until the writer declines more or the queue runs out of
    /// data.  Returns the `more` flag: true if another poll would find
    /// data, so the writer should come back without waiting for the next
    /// `NewData`.
    pub fn poll_new(
        &self,
        relay_con_id: UniqueId,
        try_push: &mut dyn FnMut(RelayChunk) -> PushResult,
    ) -> Result<bool> {
        let mut guard = self.data.lock().expect("poisoned lock");
        let d = &mut *guard;
        let conidx = d.con_index(relay_con_id)?;

        let mut can_retry = true;
        let mut cur = d.cons[conidx].recv_list.back_index();
        while can_retry {
            let Some(msgidx) = cur else { break };
            if !d.msgs[msgidx].has_data() {
                break;
            }
            let prev = d.cons[conidx]
                .recv_list
                .previous_index(&d.msgs, msgidx);

            debug_assert!(d.msgs[msgidx].front != NIL);
            let front_rd = d.msgs[msgidx].front;
            let is_marker = d.rds[front_rd].data.is_cancel_marker();
            let chunk = {
                let msg = &d.msgs[msgidx];
                let rd = &d.rds[front_rd].data;
                RelayChunk {
                    relay_data: rd.clone(),
                    header: rd.is_first().then(|| msg.header.clone()),
                    engine_msg_id: MessageId::new(msgidx as u64, msg.unique),
                    receiver_msg_id: msg.receiver_msg_id,
                }
            };

            let outcome = try_push(chunk);
            can_retry = outcome.can_take_more;
            if outcome.accepted {
                if let Some(receiver_msg_id) = outcome.receiver_msg_id {
                    d.msgs[msgidx].receiver_msg_id = receiver_msg_id;
                }
                let popped = d.msg_pop_rd(msgidx);
                debug_assert_eq!(popped, Some(front_rd));
                d.free_rd(front_rd);

                if is_marker {
                    // The writer saw the cancel; the record can go.
                    debug_assert!(d.msgs[msgidx].front == NIL);
                    let snd_id = d.msgs[msgidx].sender_con_id;
                    if snd_id.is_valid() {
                        d.send_erase(snd_id.index() as usize, msgidx);
                    }
                    d.recv_erase(conidx, msgidx);
                    d.free_message(msgidx);
                    trace!(target: TARGET, %relay_con_id, msgidx, "cancel marker delivered");
                } else if d.msgs[msgidx].front == NIL {
                    // Out of data: park it at the front, out of the
                    // ready part of the queue.
                    d.recv_erase(conidx, msgidx);
                    d.recv_push_front(conidx, msgidx);
                }
            }
            cur = prev;
        }

        Ok(d.recv_back_has_data(conidx))
    }

    /// Reclaim completed buffers and surface receiver-side cancellations.
    ///
    /// Called by the sending connection's writer after a `DoneData`
    /// notification.  `done_fn` receives every returned buffer in the
    /// order the receiver completed them; `cancel_fn` receives the header
    /// of every message whose receiver gave up, so the writer can emit a
    /// cancel request upstream.
    pub fn poll_done(
        &self,
        relay_con_id: UniqueId,
        done_fn: &mut dyn FnMut(Bytes),
        cancel_fn: &mut dyn FnMut(&MessageHeader),
    ) -> Result<()> {
        let mut guard = self.data.lock().expect("poisoned lock");
        let d = &mut *guard;
        let conidx = d.con_index(relay_con_id)?;

        Self::drain_done(d, conidx, done_fn);

        // Canceled messages park at the front of the send list.
        while let Some(msgidx) = d.cons[conidx].send_list.front_index() {
            if d.msgs[msgidx].state != MessageState::RecvCancel {
                break;
            }
            let popped = d.send_pop_front(conidx);
            debug_assert_eq!(popped, Some(msgidx));
            debug_assert!(d.msgs[msgidx].receiver_con_id.is_invalid());
            while let Some(rdidx) = d.msg_pop_rd(msgidx) {
                if let Some(buffer) = d.rds[rdidx].data.take_data() {
                    done_fn(buffer);
                }
                d.free_rd(rdidx);
            }
            cancel_fn(&d.msgs[msgidx].header);
            d.free_message(msgidx);
        }
        Ok(())
    }

    /// Hand every record on a connection's done queue to `done_fn`,
    /// front first.
    fn drain_done(d: &mut EngineData, conidx: usize, done_fn: &mut dyn FnMut(Bytes)) {
        let mut cur = d.cons[conidx].done_front;
        d.cons[conidx].done_front = NIL;
        d.cons[conidx].done_back = NIL;
        while cur != NIL {
            let next = d.rds[cur].next;
            if let Some(buffer) = d.rds[cur].data.take_data() {
                done_fn(buffer);
            }
            d.free_rd(cur);
            cur = next;
        }
    }

    /// Account one transmitted chunk.
    ///
    /// Called by the receiving connection's writer once the chunk from
    /// [`poll_new`](Self::poll_new) is on the wire.  The buffer inside
    /// rides the sender's done queue back to its owner.  Returns the
    /// `more` flag for the calling writer.
    pub fn complete(&self, relay_con_id: UniqueId, chunk: RelayChunk) -> Result<bool> {
        let mut guard = self.data.lock().expect("poisoned lock");
        let d = &mut *guard;
        let conidx = d.con_index(relay_con_id)?;

        let Ok(msgidx) = d.msg_index(chunk.engine_msg_id) else {
            // The message went away under the writer; this happens for
            // relayed cancel-request completions and carries no buffer
            // worth accounting.
            trace!(target: TARGET, %relay_con_id, "complete for gone message");
            return Ok(d.recv_back_has_data(conidx));
        };

        let snd_id = d.msgs[msgidx].sender_con_id;

        if d.msgs[msgidx].state == MessageState::RecvCancel {
            // The caller canceled this message already and is now
            // accounting a chunk it still held.  The buffer goes home with
            // the pending cancellation; the record is no longer on the
            // caller's lists, so nothing else moves.
            if snd_id.is_valid() {
                let sidx = snd_id.index() as usize;
                let should_notify = d.cons[sidx].done_is_empty();
                let rdidx = d.create_rd(chunk.relay_data);
                d.done_push(sidx, rdidx);
                if should_notify {
                    self.notify(d.cons[sidx].actor_id, RelayNotification::DoneData);
                }
            }
            return Ok(d.recv_back_has_data(conidx));
        }

        let rcv_id = d.msgs[msgidx].receiver_con_id;
        debug_assert!(rcv_id.is_valid() && rcv_id.index() as usize == conidx);

        if snd_id.is_invalid() {
            // The sender vanished mid-flight; nobody owns the buffer
            // anymore, so it simply drops here.
            trace!(target: TARGET, %relay_con_id, msgidx, "complete with sender gone");
            return Ok(d.recv_back_has_data(conidx));
        }
        let sidx = snd_id.index() as usize;

        let is_last = chunk.relay_data.is_last();
        let awaits_response = chunk
            .relay_data
            .message_flags()
            .contains(MessageFlags::AWAIT_RESPONSE);

        let should_notify = d.cons[sidx].done_is_empty();
        let rdidx = d.create_rd(chunk.relay_data);
        d.done_push(sidx, rdidx);
        if should_notify {
            self.notify(d.cons[sidx].actor_id, RelayNotification::DoneData);
        }

        if is_last {
            if d.msgs[msgidx].state == MessageState::Relay && awaits_response {
                debug_assert!(d.msgs[msgidx].front == NIL);
                d.msgs[msgidx].state = MessageState::WaitResponse;
                // Parked: to the front, out of the writer's way.
                d.recv_erase(conidx, msgidx);
                d.recv_push_front(conidx, msgidx);
                trace!(target: TARGET, %relay_con_id, msgidx, "message awaiting response");
            } else {
                // Terminal completion.  A sender cancel that raced the
                // final chunk loses; retire its marker with the record.
                while let Some(leftover) = d.msg_pop_rd(msgidx) {
                    d.free_rd(leftover);
                }
                d.recv_erase(conidx, msgidx);
                d.send_erase(sidx, msgidx);
                d.free_message(msgidx);
                trace!(target: TARGET, %relay_con_id, msgidx, "message complete");
            }
        }

        Ok(d.recv_back_has_data(conidx))
    }

    /// Cancel a message from either side.
    ///
    /// From the sender: every buffered chunk returns through `done_fn` at
    /// once, and if a receiver is attached a synthetic marker rides its
    /// queue so the far writer announces the cancel.  From the receiver:
    /// the message detaches from the receiver, the optionally returned
    /// in-flight chunk joins the sender's done queue, and the record parks
    /// at the front of the sender's send list as a `RecvCancel` for its
    /// writer to pick up.
    pub fn cancel(
        &self,
        relay_con_id: UniqueId,
        chunk: Option<RelayChunk>,
        engine_msg_id: MessageId,
        done_fn: &mut dyn FnMut(Bytes),
    ) -> Result<()> {
        let mut guard = self.data.lock().expect("poisoned lock");
        let d = &mut *guard;
        let conidx = d.con_index(relay_con_id)?;

        let Ok(msgidx) = d.msg_index(engine_msg_id) else {
            // Already gone; nothing to unwind.
            trace!(target: TARGET, %relay_con_id, "cancel for gone message");
            return Ok(());
        };

        if d.msgs[msgidx].sender_con_id == relay_con_id {
            debug_assert!(chunk.is_none());
            if d.msgs[msgidx].state == MessageState::SendCancel {
                // Duplicate cancel; the marker is already on its way.
                return Ok(());
            }
            // The receiver may hold a buffer of this message right now, so
            // the record cannot be unlinked from us yet; but everything
            // still queued comes home immediately.
            while let Some(rdidx) = d.msg_pop_rd(msgidx) {
                d.done_push(conidx, rdidx);
            }
            Self::drain_done(d, conidx, done_fn);

            let rcv_id = d.msgs[msgidx].receiver_con_id;
            if rcv_id.is_valid() {
                let ridx = rcv_id.index() as usize;
                d.msgs[msgidx].state = MessageState::SendCancel;
                let marker = d.create_rd(RelayData::cancel_marker());
                d.msg_push_rd(msgidx, marker);
                let should_notify = d.should_notify_new(ridx, Some(msgidx));
                d.recv_erase(ridx, msgidx);
                d.recv_push_back(ridx, msgidx);
                trace!(target: TARGET, %relay_con_id, msgidx, "sender cancel, marker queued");
                if should_notify {
                    self.notify(d.cons[ridx].actor_id, RelayNotification::NewData);
                }
            } else {
                d.send_erase(conidx, msgidx);
                d.free_message(msgidx);
                trace!(target: TARGET, %relay_con_id, msgidx, "sender cancel, no receiver");
            }
            return Ok(());
        }

        if d.msgs[msgidx].receiver_con_id == relay_con_id {
            d.recv_erase(conidx, msgidx);
            d.msgs[msgidx].receiver_con_id.clear();
            d.msgs[msgidx].state = MessageState::RecvCancel;

            let snd_id = d.msgs[msgidx].sender_con_id;
            if snd_id.is_valid() {
                let sidx = snd_id.index() as usize;
                let mut should_notify = d.cons[sidx].done_is_empty();
                if let Some(chunk) = chunk {
                    let rdidx = d.create_rd(chunk.relay_data);
                    d.done_push(sidx, rdidx);
                }
                should_notify =
                    should_notify || d.should_notify_recv_cancel(sidx, msgidx);
                d.send_erase(sidx, msgidx);
                d.send_push_front(sidx, msgidx);
                trace!(target: TARGET, %relay_con_id, msgidx, "receiver cancel");
                if should_notify {
                    self.notify(d.cons[sidx].actor_id, RelayNotification::DoneData);
                }
            } else {
                while let Some(rdidx) = d.msg_pop_rd(msgidx) {
                    d.free_rd(rdidx);
                }
                d.free_message(msgidx);
                trace!(target: TARGET, %relay_con_id, msgidx, "receiver cancel, no sender");
            }
            return Ok(());
        }

        // Live message, but the caller is on neither end of it anymore.
        trace!(target: TARGET, %relay_con_id, msgidx, "cancel from detached connection");
        Ok(())
    }

    /// Tear a connection down, draining both of its message lists.
    ///
    /// Every surviving message is converted into a cancellation toward its
    /// other endpoint, exactly as if the stopping connection had canceled
    /// it; buffers owned by the stopping connection die with it, buffers
    /// owed to live peers are never lost.  A stale id is a silent no-op.
    pub fn stop_connection(&self, relay_con_id: UniqueId) {
        if relay_con_id.is_invalid() {
            return;
        }
        let mut guard = self.data.lock().expect("poisoned lock");
        let d = &mut *guard;
        let Ok(conidx) = d.con_index(relay_con_id) else {
            return;
        };
        self.do_stop_connection(d, conidx);
    }

    /// Locked body of [`stop_connection`](Self::stop_connection); also the
    /// teardown path for displaced stubs during registration conflicts.
    fn do_stop_connection(&self, d: &mut EngineData, conidx: usize) {
        trace!(target: TARGET, conidx, "stopping connection");

        // Messages we were receiving: cancel toward their senders.
        while let Some(msgidx) = d.recv_pop_front(conidx) {
            d.msgs[msgidx].receiver_con_id.clear();
            let snd_id = d.msgs[msgidx].sender_con_id;
            if snd_id.is_valid() {
                let sidx = snd_id.index() as usize;
                match d.msgs[msgidx].state {
                    MessageState::Relay | MessageState::WaitResponse => {
                        d.msgs[msgidx].state = MessageState::RecvCancel;
                        let should_notify = d.should_notify_recv_cancel(sidx, msgidx);
                        d.send_erase(sidx, msgidx);
                        d.send_push_front(sidx, msgidx);
                        if should_notify {
                            self.notify(d.cons[sidx].actor_id, RelayNotification::DoneData);
                        }
                        continue;
                    }
                    MessageState::SendCancel => {
                        // Its marker can never be delivered now; take the
                        // record away from the sender too and retire it.
                        d.send_erase(sidx, msgidx);
                    }
                    MessageState::RecvCancel | MessageState::Cache => {
                        debug_assert!(false, "message in impossible state on a recv list");
                    }
                }
            }
            while let Some(rdidx) = d.msg_pop_rd(msgidx) {
                d.free_rd(rdidx);
            }
            d.free_message(msgidx);
        }

        // Messages we were sending: cancel toward their receivers.  Our
        // own buffers die with us.
        while let Some(msgidx) = d.send_pop_front(conidx) {
            d.msgs[msgidx].sender_con_id.clear();
            let rcv_id = d.msgs[msgidx].receiver_con_id;
            if rcv_id.is_valid() {
                let ridx = rcv_id.index() as usize;
                match d.msgs[msgidx].state {
                    MessageState::Relay | MessageState::WaitResponse => {
                        while let Some(rdidx) = d.msg_pop_rd(msgidx) {
                            d.free_rd(rdidx);
                        }
                        d.msgs[msgidx].state = MessageState::SendCancel;
                        let marker = d.create_rd(RelayData::cancel_marker());
                        d.msg_push_rd(msgidx, marker);
                        let should_notify = d.should_notify_new(ridx, Some(msgidx));
                        d.recv_erase(ridx, msgidx);
                        d.recv_push_back(ridx, msgidx);
                        if should_notify {
                            self.notify(d.cons[ridx].actor_id, RelayNotification::NewData);
                        }
                        continue;
                    }
                    MessageState::SendCancel => {
                        // Already canceled toward the receiver; it keeps
                        // the record until the marker is consumed.
                        continue;
                    }
                    MessageState::RecvCancel | MessageState::Cache => {
                        debug_assert!(false, "message in impossible state on a send list");
                    }
                }
            }
            while let Some(rdidx) = d.msg_pop_rd(msgidx) {
                d.free_rd(rdidx);
            }
            d.free_message(msgidx);
        }

        // Buffers waiting to be reclaimed by a writer that no longer
        // exists.
        let mut cur = d.cons[conidx].done_front;
        d.cons[conidx].done_front = NIL;
        d.cons[conidx].done_back = NIL;
        while cur != NIL {
            let next = d.rds[cur].next;
            d.free_rd(cur);
            cur = next;
        }

        if let Some(name) = d.cons[conidx].name.take() {
            if d.names.get(&name) == Some(&conidx) {
                d.names.remove(&name);
            }
        }
        d.free_connection(conidx);
    }

    /// Bind a name to a connection so senders can reach it.
    ///
    /// Adopts the placeholder stub (with all its queued work) if senders
    /// got here first.  A second connection claiming a name already held
    /// by a live one takes it over (last writer wins) and the previous
    /// holder keeps running unnamed.  `relay_con_id` is the caller's engine
    /// handle, updated in place like in [`relay_start`](Self::relay_start).
    pub fn register_connection(
        &self,
        conn_actor: ActorId,
        relay_con_id: &mut UniqueId,
        group_id: u32,
        replica_id: u16,
    ) {
        debug_assert!(conn_actor.is_valid());
        let name = RelayName::new(group_id, replica_id);
        let mut guard = self.data.lock().expect("poisoned lock");
        let d = &mut *guard;

        let named_idx = d.names.get(&name).copied();
        let current_idx = d.con_index(*relay_con_id).ok();

        let conidx = match (current_idx, named_idx) {
            (None, None) => {
                let conidx = d.create_connection();
                d.cons[conidx].name = Some(name);
                d.names.insert(name, conidx);
                conidx
            }
            (None, Some(idx)) => {
                if d.cons[idx].actor_id.is_invalid() || d.cons[idx].actor_id == conn_actor {
                    // Adopt the placeholder; queued work is preserved.
                    idx
                } else {
                    // Someone else holds the name: last writer wins.
                    d.names.remove(&name);
                    d.cons[idx].name = None;
                    let conidx = d.create_connection();
                    d.cons[conidx].name = Some(name);
                    d.names.insert(name, conidx);
                    conidx
                }
            }
            (Some(cur), Some(idx)) if cur != idx => {
                // The caller was registered unnamed (it relayed before it
                // registered) while senders queued toward a placeholder
                // under this name; fold the unnamed stub away.
                self.do_stop_connection(d, cur);
                idx
            }
            (Some(cur), Some(_)) => cur,
            (Some(cur), None) => {
                d.cons[cur].name = Some(name);
                d.names.insert(name, cur);
                cur
            }
        };

        d.cons[conidx].actor_id = conn_actor;
        *relay_con_id = UniqueId::new(conidx as u64, d.cons[conidx].unique);
        trace!(target: TARGET, %name, conidx, "connection registered");

        // Wake the registrant: a placeholder may already hold queued work.
        self.notify(conn_actor, RelayNotification::NewData);
    }
}
