//! Reliable multicast channel.
//!
//! A [`ReliableMulticastChannel`] is either the publisher of one stream or a
//! subscriber to any number of streams. Data travels by multicast. Losses
//! are repaired over point-to-point recovery connections: a subscriber sends
//! GAPFILL requests for its first missing sequence and TRANSMITOK
//! acknowledgments to its recovery peer, which answers from its own buffer.
//! Any node that calls [`setup_gap_fill`](ReliableMulticastChannel::setup_gap_fill)
//! serves such requests, so subscribers can relay for each other.
//!
//! The channel is driven by [`process`](ReliableMulticastChannel::process):
//! one call polls the transport once, applies every event, then services
//! pending gap fills and the publish path. Nothing happens between calls.

use crate::clock::Clock;
use crate::message::{sender_id, Message, MessageType, SenderId, MAX_PAYLOAD};
use crate::stream::{Receive, Stream, StreamState};
use crate::transport::{Transport, TransportEvent};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tessera_common::{ChannelConfig, ConnId, Result, Sequence, StreamId, TesseraError};
use tracing::{debug, error, info, warn};

/// Sequenced multicast with gap-fill recovery.
pub struct ReliableMulticastChannel<T: Transport, C: Clock> {
    config: ChannelConfig,
    sender: SenderId,
    transport: T,
    clock: C,
    /// Stream this node publishes; 0 for a subscriber.
    publish_stream_id: StreamId,
    multicast_conn: Option<ConnId>,
    gap_fill_listener: Option<ConnId>,
    streams: BTreeMap<StreamId, Stream>,
    /// Accepted gap-fill connections.
    peers: BTreeSet<ConnId>,
}

impl<T: Transport, C: Clock> ReliableMulticastChannel<T, C> {
    pub fn new(config: ChannelConfig, transport: T, clock: C) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sender: sender_id(&config.sender_id),
            config,
            transport,
            clock,
            publish_stream_id: 0,
            multicast_conn: None,
            gap_fill_listener: None,
            streams: BTreeMap::new(),
            peers: BTreeSet::new(),
        })
    }

    #[inline]
    pub fn is_publisher(&self) -> bool {
        self.publish_stream_id > 0
    }

    pub fn publish_stream_id(&self) -> Option<StreamId> {
        self.is_publisher().then_some(self.publish_stream_id)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Port the gap-fill listener is bound to.
    pub fn gap_fill_port(&self) -> Option<u16> {
        self.transport.local_port(self.gap_fill_listener?)
    }

    /// Number of accepted gap-fill connections still open.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Opens the multicast socket. A positive `publish_stream_id` makes this
    /// node the publisher of that stream; 0 joins the group as a subscriber.
    ///
    /// On failure the error is logged and the channel stays without a
    /// multicast path.
    pub fn setup_multicast(
        &mut self,
        interface: &str,
        group: &str,
        port: u16,
        publish_stream_id: StreamId,
    ) -> Result<()> {
        let opened = if publish_stream_id > 0 {
            self.transport.multicast_sender(interface, group, port)
        } else {
            self.transport.join_multicast(interface, group, port)
        };
        let conn = opened.map_err(|e| {
            error!(interface, group, port, error = %e, "multicast setup failed");
            e
        })?;

        self.multicast_conn = Some(conn);
        self.publish_stream_id = publish_stream_id;
        if publish_stream_id > 0 {
            let capacity = self.config.stream_buffer_capacity;
            self.streams
                .entry(publish_stream_id)
                .or_insert_with(|| Stream::new(publish_stream_id, capacity));
            info!(stream = publish_stream_id, group, port, "publishing stream");
        } else {
            info!(group, port, "joined multicast group");
        }
        Ok(())
    }

    /// Listens for gap-fill connections from downstream nodes.
    pub fn setup_gap_fill(&mut self, port: u16) -> Result<()> {
        let listener = self.transport.listen(port).map_err(|e| {
            error!(port, error = %e, "gap-fill listener setup failed");
            e
        })?;
        self.gap_fill_listener = Some(listener);
        info!(port, "gap-fill listener ready");
        Ok(())
    }

    /// Subscribes to `stream` and connects its recovery peer.
    ///
    /// Does nothing if the stream already has a recovery connection. If the
    /// connection fails the error is logged and the stream is not added.
    pub fn add_recovery_to_stream(&mut self, stream: StreamId, host: &str, port: u16) -> Result<()> {
        if stream == 0 || stream == self.publish_stream_id {
            return Err(TesseraError::InvalidParameter {
                name: "stream".to_string(),
                value: stream.to_string(),
            });
        }
        if self
            .streams
            .get(&stream)
            .is_some_and(|s| s.recovery().is_some())
        {
            return Ok(());
        }
        let conn = self.transport.connect(host, port).map_err(|e| {
            error!(stream, host, port, error = %e, "recovery connection failed");
            e
        })?;

        let capacity = self.config.stream_buffer_capacity;
        self.streams
            .entry(stream)
            .or_insert_with(|| Stream::new(stream, capacity))
            .set_recovery(Some(conn));
        info!(stream, host, port, conn, "stream added with recovery peer");
        Ok(())
    }

    /// Subscribes to `stream` without a recovery peer. Returns false if the
    /// stream id is 0 or already known.
    pub fn add_stream(&mut self, stream: StreamId) -> bool {
        if stream == 0 || self.streams.contains_key(&stream) {
            return false;
        }
        self.streams
            .insert(stream, Stream::new(stream, self.config.stream_buffer_capacity));
        info!(stream, "stream added");
        true
    }

    /// Queues a message on the published stream. It is multicast by a later
    /// [`process`](Self::process) call.
    ///
    /// Returns false when this node does not publish, the payload is larger
    /// than [`MAX_PAYLOAD`], or the buffer is still full after flushing what
    /// every client has acknowledged.
    pub fn publish_msg(&mut self, payload: &[u8]) -> bool {
        if !self.is_publisher() {
            return false;
        }
        if payload.len() > MAX_PAYLOAD {
            warn!(size = payload.len(), max = MAX_PAYLOAD, "payload too large to publish");
            return false;
        }
        let sender = self.sender;
        let Some(stream) = self.streams.get_mut(&self.publish_stream_id) else {
            return false;
        };
        match stream.publish(Bytes::copy_from_slice(payload), sender) {
            Some(seq) => {
                debug!(stream = stream.id(), seq, "message queued");
                true
            }
            None => {
                debug!(stream = stream.id(), "publish buffer full");
                false
            }
        }
    }

    /// Runs one pass: polls the transport, applies every event, serves one
    /// gap-fill message per waiting client, then multicasts the next queued
    /// message or a heartbeat. Returns the number of events handled plus
    /// messages sent.
    pub fn process(&mut self) -> usize {
        let now = self.clock.now_micros();
        let timeout = self.config.poll_timeout_micros.map(Duration::from_micros);
        let events = self.transport.poll(timeout).unwrap_or_else(|e| {
            error!(error = %e, "transport poll failed");
            Vec::new()
        });

        let mut work = events.len();
        let mut outbox = Vec::new();
        for event in events {
            self.handle_event(event, now, &mut outbox);
        }

        let sender = self.sender;
        let heartbeat_interval = self.config.heartbeat_interval_micros;
        let retry = self.config.gapfill_retry_micros;
        for stream in self.streams.values_mut() {
            outbox.extend(stream.service_gapfills());

            if stream.id() == self.publish_stream_id {
                let Some(conn) = self.multicast_conn else {
                    continue;
                };
                if let Some(msg) = stream.next_to_transmit(now) {
                    outbox.push((conn, msg));
                } else if let Some(hb) = stream.heartbeat(now, heartbeat_interval) {
                    debug!(stream = stream.id(), seq = hb.sequence, "heartbeat");
                    outbox.push((conn, hb.with_sender(sender)));
                }
            } else if let Some(recovery) = stream.recovery() {
                if let Some(req) = stream.gapfill_request(now, retry) {
                    debug!(stream = stream.id(), seq = req.sequence, "gap-fill request");
                    outbox.push((recovery, req.with_sender(sender)));
                }
            }
        }

        work += outbox.len();
        self.send_all(outbox);
        work
    }

    /// Next message of `stream` in sequence order, stopping at the first gap.
    pub fn get_next_msg_by_index(&mut self, stream: StreamId) -> Option<Message> {
        if self.is_publisher() {
            return None;
        }
        self.streams.get_mut(&stream)?.read_by_index()
    }

    /// Next real message of `stream`, skipping sequences still missing.
    pub fn get_next_msg_asap(&mut self, stream: StreamId) -> Option<Message> {
        if self.is_publisher() {
            return None;
        }
        self.streams.get_mut(&stream)?.read_asap()
    }

    /// Repositions the local reader of `stream`. Sequences already flushed
    /// clamp to the first retained one; sequences not received yet fail.
    pub fn set_read_index(&mut self, stream: StreamId, seq: Sequence) -> bool {
        if self.is_publisher() {
            return false;
        }
        self.streams
            .get_mut(&stream)
            .is_some_and(|s| s.set_read_index(seq))
    }

    pub fn stream_state(&self, stream: StreamId) -> Option<StreamState> {
        self.streams.get(&stream).map(Stream::state)
    }

    fn handle_event(&mut self, event: TransportEvent, now: u64, outbox: &mut Vec<(ConnId, Message)>) {
        match event {
            TransportEvent::Accepted { listener, conn } => {
                self.peers.insert(conn);
                info!(listener, conn, "gap-fill client connected");
            }
            TransportEvent::Closed { conn } => self.drop_connection(conn),
            TransportEvent::Message { conn, bytes } => {
                let msg = match Message::decode(&bytes) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(conn, error = %e, "undecodable message dropped");
                        return;
                    }
                };
                match msg.msg_type {
                    MessageType::GapFill | MessageType::TransmitOk => {
                        self.on_client_message(conn, msg, now)
                    }
                    _ => self.on_stream_message(conn, msg, now, outbox),
                }
            }
        }
    }

    /// GAPFILL or TRANSMITOK from a downstream node.
    fn on_client_message(&mut self, conn: ConnId, msg: Message, now: u64) {
        let Some(stream) = self.streams.get_mut(&msg.stream) else {
            debug!(conn, stream = msg.stream, "request for unknown stream ignored");
            return;
        };
        if msg.msg_type == MessageType::GapFill {
            let accepted = stream.on_gapfill(conn, msg.sequence, msg.count, now);
            debug!(
                stream = msg.stream,
                conn,
                seq = msg.sequence,
                count = msg.count,
                accepted,
                "gap-fill requested"
            );
        } else {
            stream.on_transmit_ok(conn, msg.sequence, now);
            let flushed = stream.reclaim();
            debug!(stream = msg.stream, conn, seq = msg.sequence, flushed, "transmit ok");
        }
    }

    /// Data from multicast or a gap-fill response from the recovery peer.
    fn on_stream_message(
        &mut self,
        conn: ConnId,
        msg: Message,
        now: u64,
        outbox: &mut Vec<(ConnId, Message)>,
    ) {
        if self.is_publisher() && msg.stream == self.publish_stream_id {
            return;
        }
        let Some(stream) = self.streams.get_mut(&msg.stream) else {
            debug!(conn, stream = msg.stream, "message for unknown stream ignored");
            return;
        };

        let seq = msg.sequence;
        let multicast = Some(conn) == self.multicast_conn;
        match stream.receive(msg) {
            Receive::Appended => debug!(stream = stream.id(), seq, multicast, "message buffered"),
            Receive::Recovered => debug!(stream = stream.id(), seq, multicast, "gap filled"),
            Receive::TooLate => warn!(
                stream = stream.id(),
                seq,
                first = stream.first_sequence(),
                "sequence already flushed, discarded"
            ),
            Receive::Overflow => warn!(
                stream = stream.id(),
                seq,
                capacity = self.config.stream_buffer_capacity,
                "stream buffer full, message dropped"
            ),
            Receive::Duplicate | Receive::Ignored => {}
        }

        let Some(recovery) = stream.recovery() else {
            return;
        };
        if let Some(req) = stream.gapfill_request(now, self.config.gapfill_retry_micros) {
            debug!(stream = stream.id(), seq = req.sequence, "gap-fill request");
            outbox.push((recovery, req.with_sender(self.sender)));
        }
        if let Some(ok) = stream.transmit_ok(self.config.ack_interval) {
            debug!(stream = stream.id(), seq = ok.sequence, "transmit ok");
            outbox.push((recovery, ok.with_sender(self.sender)));
        }
    }

    fn drop_connection(&mut self, conn: ConnId) {
        self.peers.remove(&conn);
        for stream in self.streams.values_mut() {
            if stream.remove_client(conn) {
                stream.reclaim();
                debug!(stream = stream.id(), conn, "downstream client removed");
            }
            if stream.recovery() == Some(conn) {
                stream.set_recovery(None);
                warn!(stream = stream.id(), conn, "recovery connection lost");
            }
        }
    }

    fn send_all(&mut self, outbox: Vec<(ConnId, Message)>) {
        for (conn, msg) in outbox {
            let sent = msg
                .encode()
                .and_then(|bytes| self.transport.send(conn, &bytes));
            if let Err(e) = sent {
                warn!(
                    conn,
                    stream = msg.stream,
                    seq = msg.sequence,
                    error = %e,
                    "send failed"
                );
            }
        }
    }
}
