//! Connection state machine.
//!
//! [`Connection`] is sans-IO: it consumes decoded packets and produces encoded
//! datagrams, and every method that depends on time takes `now`. The socket
//! task owns the clock, the UDP socket and the rate limiter.
//!
//! ```text
//!  connect()                     SYN-RST
//! ----------> Opening ------------------------> Open <----+
//!                |                              |  ^      | any packet
//!                | timeout / RST                |  +------+--- Lost
//!                v                              |  liveness window
//!              Closed <---- Closing <-----------+
//!                 ^   close-ack      close()    |
//!                 +---------------------------- + RST / timeout / force_close
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::buffers::{ReceiverBuffer, SenderBuffer, seq_gt};
use super::config::ConnectionParams;
use super::frame::{Message, MessageFlags, MessageKind, Packet, PacketFlags, PacketHeader, sizes};
use super::pacing::{CongestionController, Liveness, RetransmitController};
use super::timing::{RttEstimator, TimestampTracker};
use crate::core::{ChannelQualifier, ChannelType, ConnectError, ConnectionError, Priority};
use crate::crypto::HandshakeKey;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Connection request sent, waiting for the peer to accept.
    Opening,
    /// Established.
    Open,
    /// Established, but the peer has been silent for the liveness window.
    Lost,
    /// Draining pending sends before closing.
    Closing,
    /// Terminal.
    Closed,
}

/// How the connection came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Created by a local `connect`.
    Client,
    /// Accepted from a peer's connection request.
    Server,
    /// Established through a mediated P2P handshake.
    P2p,
}

/// Why a connection reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally.
    ThisHostClosed,
    /// Closed by the peer.
    OtherHostClosed,
    /// The peer was silent for the connection timeout.
    ConnectionTimedOut,
    /// The connection was never established.
    ConnectFailed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ThisHostClosed => "this host closed",
            Self::OtherHostClosed => "other host closed",
            Self::ConnectionTimedOut => "connection timed out",
            Self::ConnectFailed => "connect failed",
        };
        f.write_str(s)
    }
}

/// Notification produced by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A message was delivered on a channel.
    Message {
        /// Channel it arrived on.
        channel: ChannelQualifier,
        /// Payload.
        data: Vec<u8>,
    },
    /// The peer went silent for the liveness window.
    Lost,
    /// Traffic from the peer resumed after `Lost`.
    Regained,
    /// A P2P connection is established on the direct path.
    P2pEstablished,
    /// The connection reached `Closed`. Emitted exactly once.
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, Copy)]
struct ChannelState {
    /// Sequence number of the next outgoing message.
    next_send: u16,
    /// Newest sequence number delivered (in order, for ordered channels).
    last_received: u16,
}

#[derive(Debug)]
struct Outgoing {
    channel: ChannelQualifier,
    seq: u16,
    payload: Vec<u8>,
}

/// One logical session with a peer.
#[derive(Debug)]
pub struct Connection {
    kind: ConnectionKind,
    phase: ConnectionPhase,
    peer: SocketAddr,
    params: ConnectionParams,
    local_isn: u16,
    peer_isn: u16,
    handshake: Option<HandshakeKey>,

    channels: HashMap<ChannelQualifier, ChannelState>,
    sender: SenderBuffer,
    receiver: ReceiverBuffer,
    /// Unreliable messages, one queue per priority.
    unreliable: [VecDeque<Outgoing>; 4],
    unreliable_bytes: usize,
    pending_acks: BTreeSet<ChannelQualifier>,
    control: VecDeque<Message>,

    rtt: RttEstimator,
    timestamps: TimestampTracker,
    retransmit: RetransmitController,
    congestion: CongestionController,
    /// New data is waiting for acknowledgements to open the window.
    window_blocked: bool,
    liveness: Liveness,

    created_at: Instant,
    flush_at: Option<Instant>,
    syn_next: Option<Instant>,
    syn_sent: bool,
    rst_next: Option<Instant>,
    rst_sent: bool,
    close_deadline: Option<Instant>,

    events: VecDeque<ConnectionEvent>,
    open_pending: bool,
    open_result: Option<Result<(), ConnectError>>,
    reason: Option<DisconnectReason>,
}

impl Connection {
    fn new(
        kind: ConnectionKind,
        phase: ConnectionPhase,
        peer: SocketAddr,
        local_isn: u16,
        peer_isn: u16,
        params: ConnectionParams,
        now: Instant,
    ) -> Self {
        let liveness = Liveness::new(
            now,
            params.heartbeat_interval,
            params.lost_after,
            params.connection_timeout,
        );
        Self {
            kind,
            phase,
            peer,
            local_isn,
            peer_isn,
            handshake: None,
            channels: HashMap::new(),
            sender: SenderBuffer::new(params.sender_buffer_size),
            receiver: ReceiverBuffer::new(params.receiver_buffer_size),
            unreliable: Default::default(),
            unreliable_bytes: 0,
            pending_acks: BTreeSet::new(),
            control: VecDeque::new(),
            rtt: RttEstimator::new(),
            timestamps: TimestampTracker::with_start(now),
            retransmit: RetransmitController::new(params.initial_rto),
            congestion: CongestionController::new(params.tick_interval, now),
            window_blocked: false,
            liveness,
            created_at: now,
            flush_at: None,
            syn_next: None,
            syn_sent: false,
            rst_next: None,
            rst_sent: false,
            close_deadline: None,
            events: VecDeque::new(),
            open_pending: false,
            open_result: None,
            reason: None,
            params,
        }
    }

    /// Start connecting to `peer`. The first SYN goes out on the next
    /// [`poll_transmit`](Self::poll_transmit).
    pub fn connect(peer: SocketAddr, local_isn: u16, params: ConnectionParams, now: Instant) -> Self {
        let mut conn = Self::new(
            ConnectionKind::Client,
            ConnectionPhase::Opening,
            peer,
            local_isn,
            0,
            params,
            now,
        );
        conn.syn_next = Some(now);
        conn.open_pending = true;
        conn
    }

    /// Accept a connection request carrying `peer_isn`. Answers with SYN-RST.
    pub fn accept(
        peer: SocketAddr,
        local_isn: u16,
        peer_isn: u16,
        params: ConnectionParams,
        now: Instant,
    ) -> Self {
        let mut conn = Self::new(
            ConnectionKind::Server,
            ConnectionPhase::Open,
            peer,
            local_isn,
            peer_isn,
            params,
            now,
        );
        conn.control
            .push_back(Message::control(MessageFlags::SYN_RST, local_isn));
        conn
    }

    /// Establish a P2P connection after an authenticated handshake message
    /// from `peer`. `answer_syn` is set when that message was a SYN, which is
    /// answered with an authenticated SYN-RST.
    pub fn p2p(
        peer: SocketAddr,
        local_isn: u16,
        peer_isn: u16,
        key: HandshakeKey,
        answer_syn: bool,
        params: ConnectionParams,
        now: Instant,
    ) -> Self {
        let mut conn = Self::new(
            ConnectionKind::P2p,
            ConnectionPhase::Open,
            peer,
            local_isn,
            peer_isn,
            params,
            now,
        );
        conn.handshake = Some(key);
        if answer_syn {
            conn.queue_handshake_reply();
        }
        conn.events.push_back(ConnectionEvent::P2pEstablished);
        conn
    }

    /// Queue a message on `channel` at the default priority.
    ///
    /// Messages sent while `Opening` are held until the connection opens.
    pub fn send(
        &mut self,
        channel: ChannelQualifier,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        self.send_with_priority(channel, Priority::default(), data, now)
    }

    /// Queue a message on `channel` at `priority`.
    ///
    /// Higher priorities are packed first. `Immediate` messages go out on the
    /// next poll instead of waiting for the tick.
    pub fn send_with_priority(
        &mut self,
        channel: ChannelQualifier,
        priority: Priority,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        if matches!(self.phase, ConnectionPhase::Closing | ConnectionPhase::Closed) {
            return Err(ConnectionError::Closed);
        }
        if data.is_empty() {
            return Err(ConnectionError::EmptyMessage);
        }
        let max = self.params.max_payload();
        if data.len() > max {
            return Err(ConnectionError::MessageTooLarge {
                size: data.len(),
                max,
            });
        }

        let seq = self.channel(channel).next_send;
        if channel.is_reliable() {
            self.sender.push(channel, seq, priority, data)?;
        } else {
            if self.unreliable_bytes + data.len() > self.params.sender_buffer_size {
                return Err(ConnectionError::SenderBufferFull {
                    capacity: self.params.sender_buffer_size,
                });
            }
            self.unreliable_bytes += data.len();
            self.unreliable[priority.index()].push_back(Outgoing {
                channel,
                seq,
                payload: data,
            });
        }
        self.channel(channel).next_send = seq.wrapping_add(1);
        if priority == Priority::Immediate {
            self.schedule_flush(now);
        } else {
            self.schedule_flush(now + self.params.tick_interval);
        }
        Ok(())
    }

    /// Send queued messages and acknowledgements without waiting for the tick.
    pub fn flush(&mut self, now: Instant) -> Result<(), ConnectionError> {
        if self.phase == ConnectionPhase::Closed {
            return Err(ConnectionError::Closed);
        }
        self.schedule_flush(now);
        Ok(())
    }

    /// Graceful close: drain the sender buffer, then exchange RST / close-ack.
    ///
    /// No-op on a connection that is already closing or closed. Closing an
    /// `Opening` connection cancels it.
    pub fn close(&mut self, now: Instant) {
        match self.phase {
            ConnectionPhase::Opening => {
                self.resolve_open(Err(ConnectError::Cancelled));
                self.terminate(DisconnectReason::ThisHostClosed);
                self.control.clear();
            }
            ConnectionPhase::Open | ConnectionPhase::Lost => {
                debug!(peer = %self.peer, unacked = self.sender.len(), "closing connection");
                self.phase = ConnectionPhase::Closing;
                self.schedule_flush(now);
            }
            ConnectionPhase::Closing | ConnectionPhase::Closed => {}
        }
    }

    /// Graceful close that is forced once `timeout` has passed.
    pub fn close_or_force_close(&mut self, timeout: Duration, now: Instant) {
        self.close(now);
        if self.phase == ConnectionPhase::Closing && self.close_deadline.is_none() {
            self.close_deadline = Some(now + timeout);
        }
    }

    /// Close immediately, discarding everything pending. Nothing is sent.
    pub fn force_close(&mut self) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }
        self.resolve_open(Err(ConnectError::Cancelled));
        self.terminate(DisconnectReason::ThisHostClosed);
        self.control.clear();
    }

    /// Close without a handshake for `reason` (peer restarted, socket gone).
    pub fn abort(&mut self, reason: DisconnectReason) {
        self.resolve_open(Err(ConnectError::SocketClosed));
        self.terminate(reason);
        self.control.clear();
    }

    /// Whether `packet` is a fresh connection request from a peer that has
    /// forgotten this connection.
    pub fn is_restarted_by(&self, packet: &Packet) -> bool {
        if self.kind != ConnectionKind::Server || self.phase == ConnectionPhase::Closed {
            return false;
        }
        packet
            .find(MessageKind::Syn)
            .is_some_and(|syn| !syn.flags.is_prx() && syn.seq != Some(self.peer_isn))
    }

    /// Process a datagram from the peer.
    pub fn handle_packet(&mut self, packet: Packet, now: Instant) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }
        self.liveness.on_received(now);
        if self.phase == ConnectionPhase::Lost {
            debug!(peer = %self.peer, "connection regained");
            self.phase = ConnectionPhase::Open;
            self.events.push_back(ConnectionEvent::Regained);
        }

        let sample = self.timestamps.on_receive(
            packet.header.timestamp,
            packet.header.timestamp_echo,
            now,
        );
        let mut opened = false;
        let mut acked = 0;
        for message in packet.messages {
            match message.kind() {
                MessageKind::Syn => self.on_syn(&message),
                MessageKind::SynRst => opened |= self.on_syn_rst(&message, now),
                MessageKind::Rst => self.on_rst(),
                MessageKind::CloseAck => self.on_close_ack(),
                MessageKind::Data => acked += self.on_data(message, now),
            }
            if self.phase == ConnectionPhase::Closed {
                return;
            }
        }

        if let Some(sample) = sample.filter(|_| opened || acked > 0) {
            self.rtt.update(sample);
            self.retransmit.set_rto(self.rtt.rto());
            trace!(peer = %self.peer, rtt = ?sample, rto = ?self.rtt.rto(), "rtt sample");
        }
        if acked > 0 {
            self.congestion.on_ack(acked, self.rtt.srtt(), now);
            if self.window_blocked {
                self.window_blocked = false;
                self.schedule_flush(now);
            }
        }
    }

    /// Apply timers: connect timeout, liveness, connection timeout and the
    /// close-or-force-close deadline.
    pub fn handle_timeout(&mut self, now: Instant) {
        match self.phase {
            ConnectionPhase::Closed => {}
            ConnectionPhase::Opening => {
                if now >= self.created_at + self.params.connection_timeout {
                    debug!(peer = %self.peer, "connect timed out");
                    self.resolve_open(Err(ConnectError::TimedOut));
                    self.terminate(DisconnectReason::ConnectFailed);
                }
            }
            _ => {
                if self.close_deadline.is_some_and(|d| now >= d) {
                    debug!(peer = %self.peer, "graceful close expired, forcing");
                    self.force_close();
                } else if self.liveness.is_timed_out(now) {
                    self.terminate(DisconnectReason::ConnectionTimedOut);
                } else if self.phase == ConnectionPhase::Open && self.liveness.is_lost(now) {
                    debug!(peer = %self.peer, "connection lost");
                    self.phase = ConnectionPhase::Lost;
                    self.events.push_back(ConnectionEvent::Lost);
                }
            }
        }
    }

    /// Next datagram to send at `now`, if any. Call until it returns `None`.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Vec<u8>> {
        if let Some(message) = self.control.pop_front() {
            return Some(self.finish_packet(PacketFlags::NONE, vec![message], now));
        }
        match self.phase {
            ConnectionPhase::Closed => None,
            ConnectionPhase::Opening => self.poll_syn(now),
            _ => self.poll_established(now),
        }
    }

    /// Next pending notification.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Outcome of `connect`, reported once.
    pub fn take_open_result(&mut self) -> Option<Result<(), ConnectError>> {
        self.open_result.take()
    }

    /// Earliest instant [`handle_timeout`](Self::handle_timeout) or
    /// [`poll_transmit`](Self::poll_transmit) has work to do.
    pub fn next_timeout(&self) -> Option<Instant> {
        match self.phase {
            ConnectionPhase::Closed => None,
            ConnectionPhase::Opening => [
                self.syn_next,
                Some(self.created_at + self.params.connection_timeout),
            ]
            .into_iter()
            .flatten()
            .min(),
            phase => {
                let draining = phase == ConnectionPhase::Closing && self.sender.is_empty();
                [
                    self.flush_at,
                    self.sender.next_retransmit(self.retransmit.timeout()),
                    if draining { self.rst_next } else { None },
                    Some(self.liveness.heartbeat_deadline()),
                    (phase == ConnectionPhase::Open).then(|| self.liveness.lost_deadline()),
                    Some(self.liveness.timeout_deadline()),
                    self.close_deadline,
                ]
                .into_iter()
                .flatten()
                .min()
            }
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// How the connection was created.
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Reason for reaching `Closed`, once closed.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.reason
    }

    /// Established (`Open` or `Lost`).
    pub fn is_open(&self) -> bool {
        matches!(self.phase, ConnectionPhase::Open | ConnectionPhase::Lost)
    }

    /// Waiting for the peer to accept.
    pub fn is_opening(&self) -> bool {
        self.phase == ConnectionPhase::Opening
    }

    /// Terminal.
    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }

    /// Our initial sequence number.
    pub fn local_isn(&self) -> u16 {
        self.local_isn
    }

    /// The peer's initial sequence number.
    pub fn peer_isn(&self) -> u16 {
        self.peer_isn
    }

    /// Sequence number the next message on `channel` will carry.
    pub fn send_sequence(&self, channel: ChannelQualifier) -> u16 {
        self.channels
            .get(&channel)
            .map_or(self.local_isn.wrapping_add(1), |c| c.next_send)
    }

    /// Newest sequence number delivered on `channel`.
    pub fn receive_sequence(&self, channel: ChannelQualifier) -> u16 {
        self.channels
            .get(&channel)
            .map_or(self.peer_isn, |c| c.last_received)
    }

    /// Reliable messages not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.sender.len()
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.retransmit.timeout()
    }

    /// Congestion window and sending rate.
    pub fn congestion(&self) -> &CongestionController {
        &self.congestion
    }

    fn has_unreliable(&self) -> bool {
        self.unreliable.iter().any(|queue| !queue.is_empty())
    }

    fn channel(&mut self, channel: ChannelQualifier) -> &mut ChannelState {
        let (next_send, last_received) = (self.local_isn.wrapping_add(1), self.peer_isn);
        self.channels.entry(channel).or_insert(ChannelState {
            next_send,
            last_received,
        })
    }

    fn schedule_flush(&mut self, at: Instant) {
        self.flush_at = Some(self.flush_at.map_or(at, |t| t.min(at)));
    }

    fn resolve_open(&mut self, result: Result<(), ConnectError>) {
        if self.open_pending {
            self.open_pending = false;
            self.open_result = Some(result);
        }
    }

    fn terminate(&mut self, reason: DisconnectReason) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }
        debug!(peer = %self.peer, %reason, "connection closed");
        self.phase = ConnectionPhase::Closed;
        self.reason = Some(reason);
        self.sender.clear();
        self.receiver.clear();
        for queue in &mut self.unreliable {
            queue.clear();
        }
        self.unreliable_bytes = 0;
        self.pending_acks.clear();
        self.flush_at = None;
        self.syn_next = None;
        self.rst_next = None;
        self.close_deadline = None;
        self.resolve_open(Err(ConnectError::Cancelled));
        self.events
            .push_back(ConnectionEvent::Disconnected(reason));
    }

    fn queue_handshake_reply(&mut self) {
        let flags = MessageFlags::SYN_RST.with_prx();
        let Some(key) = &self.handshake else { return };
        match key.sign(flags.as_byte(), self.local_isn) {
            Ok(tag) => self
                .control
                .push_back(Message::handshake(MessageFlags::SYN_RST, self.local_isn, tag)),
            Err(e) => debug!(error = %e, "cannot sign handshake reply"),
        }
    }

    fn on_syn(&mut self, message: &Message) {
        if message.seq != Some(self.peer_isn) {
            return;
        }
        match self.kind {
            ConnectionKind::Server if !message.flags.is_prx() => {
                trace!(peer = %self.peer, "duplicate SYN, resending SYN-RST");
                self.control
                    .push_back(Message::control(MessageFlags::SYN_RST, self.local_isn));
            }
            ConnectionKind::P2p if message.flags.is_prx() => {
                let verified = self.handshake.as_ref().is_some_and(|key| {
                    key.verify(message.flags.as_byte(), self.peer_isn, &message.payload)
                });
                if verified {
                    self.queue_handshake_reply();
                }
            }
            _ => {}
        }
    }

    fn on_syn_rst(&mut self, message: &Message, now: Instant) -> bool {
        if self.phase != ConnectionPhase::Opening || message.flags.is_prx() {
            return false;
        }
        let Some(peer_isn) = message.seq else {
            return false;
        };
        self.peer_isn = peer_isn;
        for state in self.channels.values_mut() {
            state.last_received = peer_isn;
        }
        self.phase = ConnectionPhase::Open;
        self.syn_next = None;
        self.retransmit.on_ack();
        self.resolve_open(Ok(()));
        if !self.sender.is_empty() || self.has_unreliable() {
            self.schedule_flush(now);
        }
        debug!(peer = %self.peer, "connection established");
        true
    }

    fn on_rst(&mut self) {
        match self.phase {
            ConnectionPhase::Opening => {
                debug!(peer = %self.peer, "connection rejected");
                self.resolve_open(Err(ConnectError::Rejected));
                self.terminate(DisconnectReason::ConnectFailed);
            }
            ConnectionPhase::Open | ConnectionPhase::Lost => {
                self.control
                    .push_back(Message::control(MessageFlags::CLOSE_ACK, self.local_isn));
                self.terminate(DisconnectReason::OtherHostClosed);
            }
            ConnectionPhase::Closing => {
                self.control
                    .push_back(Message::control(MessageFlags::CLOSE_ACK, self.local_isn));
                self.terminate(DisconnectReason::ThisHostClosed);
            }
            ConnectionPhase::Closed => {}
        }
    }

    fn on_close_ack(&mut self) {
        match self.phase {
            ConnectionPhase::Closing => self.terminate(DisconnectReason::ThisHostClosed),
            ConnectionPhase::Open | ConnectionPhase::Lost => {
                self.terminate(DisconnectReason::OtherHostClosed)
            }
            _ => {}
        }
    }

    /// Returns the payload bytes acknowledged by `message`.
    fn on_data(&mut self, message: Message, now: Instant) -> usize {
        if self.phase == ConnectionPhase::Opening {
            return 0;
        }
        let Ok(channel) = ChannelQualifier::from_byte(message.channel) else {
            return 0;
        };
        let acked = message.ack.map_or(0, |ack| self.on_ack(channel, ack));
        let Some(seq) = message.seq.filter(|_| !message.payload.is_empty()) else {
            return acked;
        };
        let data = message.payload;

        match channel.channel_type() {
            ChannelType::Unreliable => self.deliver(channel, data),
            ChannelType::UnreliableSequenced | ChannelType::ReliableSequenced => {
                let state = self.channel(channel);
                if seq_gt(seq, state.last_received) {
                    state.last_received = seq;
                    self.deliver(channel, data);
                } else {
                    trace!(peer = %self.peer, seq, "dropping stale sequenced message");
                }
                if channel.is_reliable() {
                    self.queue_ack(channel, now);
                }
            }
            ChannelType::ReliableOrdered => {
                let expected = self.channel(channel).last_received.wrapping_add(1);
                if seq == expected {
                    self.deliver(channel, data);
                    let mut last = seq;
                    while let Some(next) = self.receiver.take(channel, last.wrapping_add(1)) {
                        last = last.wrapping_add(1);
                        self.deliver(channel, next);
                    }
                    self.channel(channel).last_received = last;
                } else if seq_gt(seq, expected) {
                    if !self.receiver.insert(channel, seq, data) {
                        trace!(peer = %self.peer, seq, "reorder buffer full or duplicate");
                    }
                } else {
                    trace!(peer = %self.peer, seq, "duplicate message, re-acking");
                }
                self.queue_ack(channel, now);
            }
        }
        acked
    }

    fn on_ack(&mut self, channel: ChannelQualifier, ack: u16) -> usize {
        let last_sent = self.channel(channel).next_send.wrapping_sub(1);
        if seq_gt(ack, last_sent) {
            trace!(peer = %self.peer, ack, "ack for unsent data ignored");
            return 0;
        }
        let freed = self.sender.ack(channel, ack);
        if freed > 0 {
            self.retransmit.on_ack();
        }
        freed
    }

    fn deliver(&mut self, channel: ChannelQualifier, data: Vec<u8>) {
        self.events
            .push_back(ConnectionEvent::Message { channel, data });
    }

    fn queue_ack(&mut self, channel: ChannelQualifier, now: Instant) {
        self.pending_acks.insert(channel);
        self.schedule_flush(now + self.params.tick_interval);
    }

    fn poll_syn(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.kind != ConnectionKind::Client || !self.syn_next.is_some_and(|t| now >= t) {
            return None;
        }
        if self.syn_sent {
            self.retransmit.on_retransmit(now);
        }
        self.syn_sent = true;
        self.syn_next = Some(now + self.retransmit.timeout());
        let syn = Message::control(MessageFlags::SYN, self.local_isn);
        Some(self.finish_packet(PacketFlags::NONE, vec![syn], now))
    }

    fn poll_established(&mut self, now: Instant) -> Option<Vec<u8>> {
        let budget = self.params.mtu - sizes::PACKET_HEADER_SIZE;
        let data_header = sizes::MESSAGE_HEADER_SIZE + sizes::SEQ_SIZE;
        let tick_due = self.flush_at.is_some_and(|t| now >= t);
        let packet = self.congestion.packets_sent() + 1;
        let mut messages = Vec::new();
        let mut used = 0;
        let mut data_bytes = 0;
        let mut blocked = false;

        if tick_due {
            while let Some(&channel) = self.pending_acks.first() {
                let ack = Message::ack(channel.as_byte(), self.channel(channel).last_received);
                if used + ack.encoded_len() > budget {
                    break;
                }
                used += ack.encoded_len();
                messages.push(ack);
                self.pending_acks.remove(&channel);
            }
        }

        // Retransmissions ignore the congestion window.
        let timeout = self.retransmit.timeout();
        let mut lost: Option<u64> = None;
        for entry in self.sender.iter_mut() {
            if !entry.last_sent.is_some_and(|sent| now >= sent + timeout) {
                continue;
            }
            if used + data_header + entry.payload.len() > budget {
                break;
            }
            lost = Some(lost.map_or(entry.packet, |p| p.min(entry.packet)));
            entry.last_sent = Some(now);
            entry.packet = packet;
            used += data_header + entry.payload.len();
            data_bytes += entry.payload.len();
            messages.push(Message::data(
                entry.channel.as_byte(),
                entry.seq,
                entry.payload.clone(),
            ));
        }
        if let Some(lost) = lost {
            let repeated = self.retransmit.retransmit_count() > 0;
            if self.retransmit.on_retransmit(now) {
                self.congestion.on_loss(lost, now);
                if repeated {
                    self.congestion.on_timeout();
                }
            }
            trace!(
                peer = %self.peer,
                rto = ?self.retransmit.timeout(),
                rate = ?self.congestion.sending_rate(),
                "retransmitting"
            );
        }

        if tick_due {
            let mut in_flight = self.sender.in_flight();
            'levels: for priority in Priority::ALL {
                let queue = &mut self.unreliable[priority.index()];
                while let Some(front) = queue.front() {
                    if used + data_header + front.payload.len() > budget {
                        break 'levels;
                    }
                    if !self.congestion.rate_ready(now) {
                        blocked = true;
                        break 'levels;
                    }
                    let Some(out) = queue.pop_front() else { break };
                    used += data_header + out.payload.len();
                    data_bytes += out.payload.len();
                    self.unreliable_bytes -= out.payload.len();
                    messages.push(Message::data(out.channel.as_byte(), out.seq, out.payload));
                }
                for entry in self.sender.iter_mut() {
                    if entry.last_sent.is_some() || entry.priority != priority {
                        continue;
                    }
                    if used + data_header + entry.payload.len() > budget {
                        break 'levels;
                    }
                    if !self.congestion.can_send(in_flight, entry.payload.len(), now) {
                        blocked = true;
                        break 'levels;
                    }
                    in_flight += entry.payload.len();
                    entry.last_sent = Some(now);
                    entry.packet = packet;
                    used += data_header + entry.payload.len();
                    data_bytes += entry.payload.len();
                    messages.push(Message::data(
                        entry.channel.as_byte(),
                        entry.seq,
                        entry.payload.clone(),
                    ));
                }
            }
        }

        if self.phase == ConnectionPhase::Closing
            && self.sender.is_empty()
            && !self.has_unreliable()
            && self.rst_next.is_none_or(|t| now >= t)
        {
            let rst = Message::control(MessageFlags::RST, self.local_isn);
            if used + rst.encoded_len() <= budget {
                if self.rst_sent {
                    self.retransmit.on_retransmit(now);
                }
                self.rst_sent = true;
                self.rst_next = Some(now + self.retransmit.timeout());
                messages.push(rst);
            }
        }

        if data_bytes > 0 {
            self.congestion.on_sent(data_bytes);
        }
        if tick_due && self.pending_acks.is_empty() {
            if blocked {
                // A spent rate budget refills on its own; a full window waits
                // for acknowledgements.
                self.flush_at = self.congestion.next_send_time();
                self.window_blocked = self.flush_at.is_none();
            } else if !self.has_unreliable() && !self.sender.has_unsent() {
                self.flush_at = None;
            }
        }

        if !messages.is_empty() {
            return Some(self.finish_packet(PacketFlags::NONE, messages, now));
        }
        if self.liveness.needs_heartbeat(now) {
            return Some(self.finish_packet(PacketFlags::HEARTBEAT, Vec::new(), now));
        }
        None
    }

    fn finish_packet(&mut self, flags: PacketFlags, messages: Vec<Message>, now: Instant) -> Vec<u8> {
        let timestamp = self.timestamps.timestamp(now);
        let packet = Packet {
            header: PacketHeader {
                flags,
                timestamp,
                timestamp_echo: self.timestamps.timestamp_echo(),
            },
            messages,
        };
        self.timestamps.on_send(timestamp, now);
        self.liveness.on_sent(now);
        packet.encode()
    }
}
