//! Per-connection protocol state machine.
//!
//! [`Connection`] tracks one side of an established connection: the sliding
//! send window with per-message retransmission back-off, the overflow queue
//! for writes beyond the window, the reorder buffer for inbound data, and
//! the epoch-driven liveness counter. It performs no I/O: every transition
//! returns the messages to put on the wire and the payloads that became
//! deliverable, and the owning endpoint task does the rest. Exactly one
//! task mutates a `Connection`, so no locking is needed here.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::params::Params;
use crate::wire::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloseState {
    Active,
    Draining,
    Lost,
    Closed,
}

/// What started a drain; decides what the server reports when it finishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DrainReason {
    /// `close` / `close_conn` on this connection.
    LocalClose,
    /// The whole endpoint is shutting down.
    Shutdown,
}

/// One in-flight data message awaiting acknowledgment.
#[derive(Debug)]
struct WindowEntry {
    msg: Message,
    /// Current gap, in epochs, between transmissions of this message.
    back_off: u32,
    /// Epoch ticks left before the next retransmission.
    epochs_until_retry: u32,
    transmissions: u32,
}

/// Result of an epoch tick.
#[derive(Debug, Default)]
pub(crate) struct EpochActions {
    /// Retransmissions, or a lone heartbeat for an otherwise silent epoch.
    pub(crate) send: Vec<Message>,
    /// The peer has been silent for the epoch limit.
    pub(crate) lost: bool,
}

pub(crate) struct Connection {
    conn_id: u32,
    remote: SocketAddr,
    params: Params,

    // Outbound.
    next_send_seq: u32,
    window: BTreeMap<u32, WindowEntry>,
    pending: VecDeque<Message>,

    // Inbound.
    next_recv_seq: u32,
    ahead: BTreeMap<u32, Bytes>,

    // Liveness.
    epochs_idle: u32,
    sent_this_epoch: bool,

    state: CloseState,
    drain_reason: Option<DrainReason>,
}

impl Connection {
    /// Both directions of a connection start one past the initial sequence
    /// number chosen by the connecting client.
    pub(crate) fn new(conn_id: u32, remote: SocketAddr, initial_seq: u32, params: Params) -> Self {
        Self {
            conn_id,
            remote,
            params,
            next_send_seq: initial_seq + 1,
            window: BTreeMap::new(),
            pending: VecDeque::new(),
            next_recv_seq: initial_seq + 1,
            ahead: BTreeMap::new(),
            epochs_idle: 0,
            sent_this_epoch: false,
            state: CloseState::Active,
            drain_reason: None,
        }
    }

    pub(crate) fn conn_id(&self) -> u32 {
        self.conn_id
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == CloseState::Active
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.state == CloseState::Draining
    }

    pub(crate) fn drain_reason(&self) -> Option<DrainReason> {
        self.drain_reason
    }

    /// Lowest sequence number still awaiting acknowledgment; the left edge
    /// of the window.
    fn oldest_unacked(&self) -> u32 {
        if let Some((&seq, _)) = self.window.iter().next() {
            seq
        } else if let Some(front) = self.pending.front() {
            front.seq()
        } else {
            self.next_send_seq
        }
    }

    /// Whether `seq` may go on the wire right now: room under the in-flight
    /// cap and within the window span.
    fn may_transmit(&self, seq: u32) -> bool {
        self.window.len() < self.params.max_in_flight()
            && seq < self.oldest_unacked().saturating_add(self.params.window_size)
    }

    /// Place a message into the window, fresh back-off, about to be sent.
    fn stage(&mut self, msg: Message) {
        self.sent_this_epoch = true;
        self.window.insert(
            msg.seq(),
            WindowEntry { msg, back_off: 1, epochs_until_retry: 1, transmissions: 1 },
        );
    }

    /// Move queued writes into freed window slots, in order.
    fn pump_pending(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        loop {
            let Some(front) = self.pending.front() else { break };
            if !self.may_transmit(front.seq()) {
                break;
            }
            let Some(msg) = self.pending.pop_front() else { break };
            self.stage(msg.clone());
            out.push(msg);
        }
        out
    }

    /// Submit one application payload. Sequence numbers are assigned in call
    /// order. Returns the message to transmit now, or nothing when the write
    /// overflowed into the pending queue.
    pub(crate) fn write(&mut self, payload: Bytes) -> Vec<Message> {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        let msg = Message::data(self.conn_id, seq, payload);
        if self.pending.is_empty() && self.may_transmit(seq) {
            self.stage(msg.clone());
            vec![msg]
        } else {
            trace!(target: "liveseq::conn", conn_id = self.conn_id, seq, "window full, write queued");
            self.pending.push_back(msg);
            Vec::new()
        }
    }

    /// Point acknowledgment of `seq`. Seq 0 is the heartbeat and only counts
    /// as liveness. Returns queued writes that now fit in the window.
    pub(crate) fn handle_ack(&mut self, seq: u32) -> Vec<Message> {
        self.note_activity();
        if seq == 0 || self.window.remove(&seq).is_none() {
            return Vec::new();
        }
        trace!(target: "liveseq::conn", conn_id = self.conn_id, seq, "acked");
        self.pump_pending()
    }

    /// Cumulative acknowledgment: drops every window entry up to and
    /// including `seq`. Returns queued writes that now fit in the window.
    pub(crate) fn handle_cack(&mut self, seq: u32) -> Vec<Message> {
        self.note_activity();
        let keep = self.window.split_off(&seq.saturating_add(1));
        let dropped = std::mem::replace(&mut self.window, keep).len();
        if dropped == 0 {
            return Vec::new();
        }
        trace!(target: "liveseq::conn", conn_id = self.conn_id, seq, dropped, "cumulatively acked");
        self.pump_pending()
    }

    /// Inbound data message, already checksum-verified by the codec.
    ///
    /// Returns the acknowledgment to send (always, duplicates included, so a
    /// retransmitting peer sees us alive) and any payloads that just became
    /// deliverable in order.
    pub(crate) fn handle_data(&mut self, seq: u32, payload: Bytes) -> (Message, Vec<Bytes>) {
        self.note_activity();
        self.sent_this_epoch = true;
        let ack = Message::ack(self.conn_id, seq);
        if seq >= self.next_recv_seq {
            // Re-inserting a duplicate is benign: verified payloads for one
            // sequence number are identical.
            self.ahead.insert(seq, payload);
        }
        let mut ready = Vec::new();
        while let Some(next) = self.ahead.remove(&self.next_recv_seq) {
            ready.push(next);
            self.next_recv_seq += 1;
        }
        (ack, ready)
    }

    /// Record that the peer showed a sign of life.
    pub(crate) fn note_activity(&mut self) {
        self.epochs_idle = 0;
    }

    /// Record an outbound message not produced by this state machine (the
    /// server's re-ack of a duplicate connect), so the heartbeat stays quiet.
    pub(crate) fn note_sent(&mut self) {
        self.sent_this_epoch = true;
    }

    /// Advance the epoch timer: liveness accounting, retransmissions, and
    /// the keep-alive heartbeat for an otherwise silent epoch.
    pub(crate) fn on_epoch(&mut self) -> EpochActions {
        self.epochs_idle += 1;
        if self.epochs_idle >= self.params.epoch_limit {
            self.state = CloseState::Lost;
            debug!(
                target: "liveseq::conn",
                conn_id = self.conn_id,
                epochs = self.epochs_idle,
                "peer silent, connection lost"
            );
            return EpochActions { send: Vec::new(), lost: true };
        }

        let cap = self.params.back_off_cap();
        let mut send = Vec::new();
        for entry in self.window.values_mut() {
            entry.epochs_until_retry -= 1;
            if entry.epochs_until_retry == 0 {
                entry.back_off = (entry.back_off * 2).min(cap);
                entry.epochs_until_retry = entry.back_off;
                entry.transmissions += 1;
                send.push(entry.msg.clone());
            }
        }
        if !send.is_empty() {
            trace!(
                target: "liveseq::conn",
                conn_id = self.conn_id,
                count = send.len(),
                "retransmitting"
            );
        } else if !self.sent_this_epoch {
            send.push(Message::ack(self.conn_id, 0));
        }
        self.sent_this_epoch = false;
        EpochActions { send, lost: false }
    }

    /// Stop accepting writes; the window and pending queue keep draining.
    pub(crate) fn begin_drain(&mut self, reason: DrainReason) {
        if self.state == CloseState::Active {
            self.state = CloseState::Draining;
            self.drain_reason = Some(reason);
        }
    }

    /// Every sent payload has been acknowledged and nothing is queued.
    pub(crate) fn drained(&self) -> bool {
        self.window.is_empty() && self.pending.is_empty()
    }

    pub(crate) fn finish_close(&mut self) {
        self.state = CloseState::Closed;
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.window.len()
    }

    #[cfg(test)]
    fn transmissions_of(&self, seq: u32) -> u32 {
        self.window.get(&seq).map_or(0, |e| e.transmissions)
    }
}
