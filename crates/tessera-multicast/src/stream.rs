//! Per-stream sequencing state.
//!
//! A [`Stream`] owns the sequenced message buffer for one stream id and
//! every cursor the protocol keeps over it:
//!
//! - `next_nogap`: one past the highest sequence received without a gap
//! - `local_read_index`: next message for the local reader, or for a
//!   publisher the next message to multicast
//! - one [`ClientState`] per downstream peer with its gap-fill request and
//!   acknowledged sequence
//!
//! Slots in the buffer hold either a real message or a FILLER that marks a
//! sequence known to exist but not received yet. The stream itself does no
//! I/O; it returns the messages the channel should send.

use crate::message::{Message, MessageType, SenderId};
use bytes::Bytes;
use std::collections::BTreeMap;
use tessera_buffer::SequencedBuffer;
use tessera_common::{ConnId, Sequence, StreamId};
use tracing::debug;

/// Outcome of offering a received message to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receive {
    /// Appended at or past the tail, with fillers for any skipped sequences.
    Appended,
    /// Replaced a filler inside the buffer.
    Recovered,
    /// The slot already holds a real message.
    Duplicate,
    /// Below the retained window; the sequence can no longer be stored.
    TooLate,
    /// Not enough room to reach the sequence, even after reclaiming.
    Overflow,
    /// Not a data message.
    Ignored,
}

/// A downstream peer known to this stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState {
    pub conn: ConnId,
    /// Next sequence owed to the client.
    pub gap_fill_index: Sequence,
    /// Messages still owed; zero when no request is pending.
    pub gap_fill_count: u8,
    /// Highest sequence the client acknowledged, if any.
    pub acked: Option<Sequence>,
    pub last_event_micros: u64,
}

impl ClientState {
    fn new(conn: ConnId) -> Self {
        Self {
            conn,
            gap_fill_index: 0,
            gap_fill_count: 0,
            acked: None,
            last_event_micros: 0,
        }
    }

    fn acknowledge(&mut self, seq: Sequence) {
        self.acked = Some(self.acked.map_or(seq, |a| a.max(seq)));
    }
}

/// Snapshot of a stream's cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamState {
    pub stream: StreamId,
    pub first_sequence: Sequence,
    pub next_sequence: Sequence,
    pub max_nogap_sequence: Option<Sequence>,
    pub local_read_index: Sequence,
    pub buffered: usize,
    pub clients: usize,
    pub has_recovery: bool,
}

/// Sequencing state for one stream.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    buffer: SequencedBuffer<Message>,
    next_nogap: Sequence,
    local_read_index: Sequence,
    recovery: Option<ConnId>,
    clients: BTreeMap<ConnId, ClientState>,
    /// Time of the last multicast transmission (publisher only).
    last_sent_micros: u64,
    last_gapfill_micros: u64,
    last_gapfill_boundary: Option<Sequence>,
    /// `next_nogap` when the last TRANSMITOK was produced.
    last_acked: Sequence,
}

impl Stream {
    pub fn new(id: StreamId, capacity: usize) -> Self {
        Self {
            id,
            buffer: SequencedBuffer::new(capacity),
            next_nogap: 0,
            local_read_index: 0,
            recovery: None,
            clients: BTreeMap::new(),
            last_sent_micros: 0,
            last_gapfill_micros: 0,
            last_gapfill_boundary: None,
            last_acked: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Connection gap-fill requests and acknowledgments go to.
    #[inline]
    pub fn recovery(&self) -> Option<ConnId> {
        self.recovery
    }

    pub(crate) fn set_recovery(&mut self, conn: Option<ConnId>) {
        self.recovery = conn;
    }

    #[inline]
    pub fn first_sequence(&self) -> Sequence {
        self.buffer.first_sequence()
    }

    #[inline]
    pub fn next_sequence(&self) -> Sequence {
        self.buffer.next_sequence()
    }

    /// Highest sequence received with no gap before it.
    #[inline]
    pub fn max_nogap_sequence(&self) -> Option<Sequence> {
        self.next_nogap.checked_sub(1)
    }

    #[inline]
    pub fn local_read_index(&self) -> Sequence {
        self.local_read_index
    }

    /// Returns true while at least one filler sits past the gapless prefix.
    #[inline]
    pub fn is_gapped(&self) -> bool {
        self.next_nogap < self.buffer.next_sequence()
    }

    pub fn get(&self, seq: Sequence) -> Option<&Message> {
        self.buffer.get(seq)
    }

    pub fn client(&self, conn: ConnId) -> Option<&ClientState> {
        self.clients.get(&conn)
    }

    pub fn state(&self) -> StreamState {
        StreamState {
            stream: self.id,
            first_sequence: self.buffer.first_sequence(),
            next_sequence: self.buffer.next_sequence(),
            max_nogap_sequence: self.max_nogap_sequence(),
            local_read_index: self.local_read_index,
            buffered: self.buffer.len(),
            clients: self.clients.len(),
            has_recovery: self.recovery.is_some(),
        }
    }

    fn room(&self) -> usize {
        self.buffer.capacity() - self.buffer.len()
    }

    /// Moves `next_nogap` over every real message that follows it.
    fn advance(&mut self) {
        let next = self.buffer.next_sequence();
        self.next_nogap = self.next_nogap.max(self.buffer.first_sequence());
        while self.next_nogap < next {
            match self.buffer.get(self.next_nogap) {
                Some(msg) if !msg.is_filler() => self.next_nogap += 1,
                _ => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // Publisher side
    // ------------------------------------------------------------------

    /// Appends a new application message. Returns its sequence, or `None`
    /// if the buffer is still full after reclaiming.
    pub fn publish(&mut self, payload: Bytes, sender: SenderId) -> Option<Sequence> {
        if self.buffer.is_full() {
            self.reclaim();
        }
        let seq = self.buffer.next_sequence();
        self.buffer
            .insert(Message::application(self.id, seq, payload).with_sender(sender))?;
        self.advance();
        Some(seq)
    }

    /// Next buffered message not multicast yet.
    pub fn next_to_transmit(&mut self, now: u64) -> Option<Message> {
        if self.local_read_index >= self.next_nogap {
            return None;
        }
        let msg = self.buffer.get(self.local_read_index)?.clone();
        self.local_read_index += 1;
        self.last_sent_micros = now;
        Some(msg)
    }

    /// Heartbeat carrying the last published sequence, once the stream has
    /// been idle for more than `interval` micros. Nothing is sent before the
    /// first publish.
    pub fn heartbeat(&mut self, now: u64, interval: u64) -> Option<Message> {
        let last = self.buffer.next_sequence().checked_sub(1)?;
        if now.saturating_sub(self.last_sent_micros) <= interval {
            return None;
        }
        self.last_sent_micros = now;
        Some(Message::new(MessageType::Heartbeat, self.id, last))
    }

    // ------------------------------------------------------------------
    // Subscriber side
    // ------------------------------------------------------------------

    /// Stores a received APPLICATION or HEARTBEAT message.
    ///
    /// A message past the tail is appended after fillers for the skipped
    /// sequences; a heartbeat is stored as a filler for the sequence it
    /// announces. A message inside the buffer only replaces a filler.
    pub fn receive(&mut self, mut msg: Message) -> Receive {
        if !matches!(
            msg.msg_type,
            MessageType::Application | MessageType::Heartbeat
        ) {
            return Receive::Ignored;
        }
        let seq = msg.sequence;
        if seq < self.buffer.first_sequence() {
            return Receive::TooLate;
        }

        let outcome = if seq >= self.buffer.next_sequence() {
            let needed = (seq - self.buffer.next_sequence()).saturating_add(1);
            if (self.room() as u64) < needed {
                self.reclaim();
            }
            if msg.msg_type == MessageType::Heartbeat {
                msg.msg_type = MessageType::Filler;
            }
            let mut outcome = Receive::Appended;
            while self.buffer.next_sequence() < seq {
                let gap = self.buffer.next_sequence();
                if self.buffer.insert(Message::filler(self.id, gap)).is_none() {
                    outcome = Receive::Overflow;
                    break;
                }
            }
            if outcome == Receive::Appended && self.buffer.insert(msg).is_none() {
                outcome = Receive::Overflow;
            }
            outcome
        } else if msg.msg_type == MessageType::Application {
            match self.buffer.get_mut(seq) {
                Some(slot) if slot.is_filler() => {
                    *slot = msg;
                    Receive::Recovered
                }
                _ => Receive::Duplicate,
            }
        } else {
            Receive::Duplicate
        };

        self.advance();
        outcome
    }

    /// GAPFILL request for the first missing sequence.
    ///
    /// Produced when the stream is gapped and either the gap boundary moved
    /// since the last request or `retry` micros have passed.
    pub fn gapfill_request(&mut self, now: u64, retry: u64) -> Option<Message> {
        if !self.is_gapped() {
            return None;
        }
        if self.last_gapfill_boundary == Some(self.next_nogap) {
            if now.saturating_sub(self.last_gapfill_micros) < retry {
                return None;
            }
            debug!(stream = self.id, seq = self.next_nogap, "gap still open, repeating request");
        }
        self.last_gapfill_micros = now;
        self.last_gapfill_boundary = Some(self.next_nogap);
        Some(Message::new(MessageType::GapFill, self.id, self.next_nogap).with_count(1))
    }

    /// TRANSMITOK for the gapless prefix, produced every `interval`
    /// sequences or whenever the prefix crosses a multiple of `interval`.
    pub fn transmit_ok(&mut self, interval: u64) -> Option<Message> {
        let reached = self.next_nogap;
        if reached <= self.last_acked {
            return None;
        }
        if reached - self.last_acked < interval && reached / interval == self.last_acked / interval {
            return None;
        }
        self.last_acked = reached;
        Some(Message::new(MessageType::TransmitOk, self.id, reached - 1))
    }

    // ------------------------------------------------------------------
    // Recovery source side
    // ------------------------------------------------------------------

    fn client_mut(&mut self, conn: ConnId, now: u64) -> &mut ClientState {
        let id = self.id;
        let client = self.clients.entry(conn).or_insert_with(|| {
            debug!(stream = id, conn, "registered downstream client");
            ClientState::new(conn)
        });
        client.last_event_micros = now;
        client
    }

    /// Records a GAPFILL request. Ignored while the client still has one
    /// pending. The client holds everything below the requested sequence.
    pub fn on_gapfill(&mut self, conn: ConnId, seq: Sequence, count: u8, now: u64) -> bool {
        let client = self.client_mut(conn, now);
        if let Some(held) = seq.checked_sub(1) {
            client.acknowledge(held);
        }
        if client.gap_fill_count > 0 {
            return false;
        }
        client.gap_fill_index = seq;
        client.gap_fill_count = count;
        true
    }

    /// Records a TRANSMITOK acknowledgment.
    pub fn on_transmit_ok(&mut self, conn: ConnId, seq: Sequence, now: u64) {
        self.client_mut(conn, now).acknowledge(seq);
    }

    pub fn remove_client(&mut self, conn: ConnId) -> bool {
        self.clients.remove(&conn).is_some()
    }

    /// At most one gap-fill response per client with a pending request.
    ///
    /// Requests for flushed sequences are clamped to the first retained
    /// one; requests past the gapless prefix wait until it grows.
    pub fn service_gapfills(&mut self) -> Vec<(ConnId, Message)> {
        let first = self.buffer.first_sequence();
        let mut responses = Vec::new();
        for client in self.clients.values_mut() {
            if client.gap_fill_count == 0 {
                continue;
            }
            if client.gap_fill_index < first {
                let end = client
                    .gap_fill_index
                    .saturating_add(client.gap_fill_count as u64);
                client.gap_fill_index = first;
                client.gap_fill_count = end.saturating_sub(first) as u8;
                if client.gap_fill_count == 0 {
                    debug!(stream = self.id, conn = client.conn, "requested sequences already flushed");
                    continue;
                }
            }
            if client.gap_fill_index >= self.next_nogap {
                continue;
            }
            let Some(msg) = self.buffer.get(client.gap_fill_index) else {
                continue;
            };
            responses.push((client.conn, msg.clone()));
            client.gap_fill_index += 1;
            client.gap_fill_count -= 1;
        }
        responses
    }

    // ------------------------------------------------------------------
    // Local reader and flushing
    // ------------------------------------------------------------------

    /// Next message of the gapless prefix, in sequence order.
    pub fn read_by_index(&mut self) -> Option<Message> {
        if self.local_read_index >= self.next_nogap {
            return None;
        }
        let msg = self.buffer.get(self.local_read_index)?.clone();
        self.local_read_index += 1;
        self.reclaim();
        Some(msg)
    }

    /// Next real message, skipping fillers. Skipped sequences are not
    /// revisited by this reader.
    pub fn read_asap(&mut self) -> Option<Message> {
        let mut found = None;
        while self.local_read_index < self.buffer.next_sequence() {
            let seq = self.local_read_index;
            self.local_read_index += 1;
            if let Some(msg) = self.buffer.get(seq).filter(|m| !m.is_filler()) {
                found = Some(msg.clone());
                break;
            }
        }
        self.reclaim();
        found
    }

    /// Moves the reader to `seq`, clamped to the retained window. Fails if
    /// `seq` has not been buffered yet.
    pub fn set_read_index(&mut self, seq: Sequence) -> bool {
        if seq >= self.buffer.next_sequence() {
            return false;
        }
        self.local_read_index = seq.max(self.buffer.first_sequence());
        self.reclaim();
        true
    }

    /// Lowest sequence still needed by the local cursor or any client.
    pub fn flush_boundary(&self) -> Sequence {
        self.clients
            .values()
            .map(|c| c.acked.map_or(0, |a| a.saturating_add(1)))
            .fold(
                self.local_read_index.min(self.buffer.next_sequence()),
                Sequence::min,
            )
    }

    /// Discards everything below the flush boundary.
    pub fn reclaim(&mut self) -> usize {
        let flushed = self.buffer.flush_before(self.flush_boundary());
        if flushed > 0 {
            self.advance();
            debug!(
                stream = self.id,
                flushed,
                first = self.buffer.first_sequence(),
                "stream buffer flushed"
            );
        }
        flushed
    }
}
