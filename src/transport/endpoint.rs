//! The socket task.
//!
//! An [`EmiSocket`] is one UDP endpoint driven by one tokio task. The task
//! owns every [`Connection`] of the socket, keyed by peer address, plus the
//! rate limiter, the fabricated-drop generator and all timers. Handles talk to
//! it over a command channel.
//!
//! ```text
//!              +---------------------------------------------+
//!  commands -->|                                             |--> events (per connection)
//!              |  recv_from -> decode -> demux by peer addr  |
//!  datagrams ->|  timers -> poll_transmit -> rate limit      |--> datagrams
//!              |           -> fabricated drop -> send_to     |
//!              +---------------------------------------------+
//! ```

use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tracing::{debug, trace, warn};

use super::config::{ConnectionParams, SocketConfig};
use super::connection::{Connection, ConnectionEvent, DisconnectReason};
use super::frame::{Message, MessageFlags, MessageKind, Packet, is_rendezvous};
use super::handle::{Command, Connecting, ConnectionId, EmiConnection, Incoming, Status};
use super::pacing::{PacketDropper, RateLimiter};
use super::resolve::Resolve;
use super::socket::{DEFAULT_RECV_BUFFER_SIZE, DatagramSocket};
use crate::core::{ConnectError, ConnectionError, EmiError, P2pError};
use crate::crypto::{Cookie, SharedSecret};
use crate::p2p::{P2pAttempt, RendezvousMessage};

/// Capacity of the command channel shared by all handles of a socket.
const COMMAND_QUEUE: usize = 256;

/// Wake-up interval when nothing is scheduled.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// A reliable multiplexed UDP socket.
///
/// Dropping the socket force-closes all of its connections and fails pending
/// connects with `SocketClosed`.
#[derive(Debug)]
pub struct EmiSocket {
    commands: mpsc::Sender<Command>,
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl EmiSocket {
    /// Bind and start a socket. Connections accepted in listen mode arrive on
    /// the returned [`Incoming`].
    pub async fn open(config: SocketConfig) -> Result<(Self, Incoming), EmiError> {
        config.validate()?;
        let socket = DatagramSocket::bind(SocketAddr::new(config.address, config.port)).await?;
        let local_addr = socket.local_addr()?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.max_connections);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        debug!(
            %local_addr,
            listen = config.accept_connections,
            rate_limit = config.rate_limit,
            "socket open"
        );
        let driver = Driver::new(config, local_addr, commands_tx.clone(), incoming_tx);
        tokio::spawn(driver.run(socket, commands_rx, shutdown_rx));

        let socket = Self {
            commands: commands_tx,
            local_addr,
            shutdown_tx: Some(shutdown_tx),
        };
        Ok((socket, Incoming::new(incoming_rx)))
    }

    /// Local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Local port.
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Start connecting to `peer` and return the connection while it opens.
    pub async fn begin_connect(&self, peer: SocketAddr) -> Result<Connecting, ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { peer, reply })
            .await
            .map_err(|_| ConnectError::SocketClosed)?;
        rx.await.unwrap_or(Err(ConnectError::SocketClosed))
    }

    /// Connect to `peer` and wait until it accepts.
    pub async fn connect(&self, peer: SocketAddr) -> Result<EmiConnection, ConnectError> {
        self.begin_connect(peer).await?.established().await
    }

    /// Resolve `host` with `resolver`, then [`connect`](Self::connect).
    ///
    /// An address of the socket's own family is preferred.
    pub async fn connect_host<R: Resolve>(
        &self,
        host: &str,
        port: u16,
        resolver: &R,
    ) -> Result<EmiConnection, ConnectError> {
        let failed = || ConnectError::DnsResolutionFailed(host.to_string());
        let addrs = resolver.resolve(host, port).await.map_err(|e| {
            debug!(host, error = %e, "resolution failed");
            failed()
        })?;
        let peer = addrs
            .iter()
            .find(|a| a.is_ipv4() == self.local_addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(failed)?;
        self.connect(peer).await
    }

    /// Establish a P2P connection through `mediator` with a cookie and the
    /// secret shared with the other peer.
    pub async fn connect_p2p(
        &self,
        mediator: SocketAddr,
        cookie: Cookie,
        secret: SharedSecret,
    ) -> Result<EmiConnection, P2pError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::ConnectP2p {
            mediator,
            cookie,
            secret,
            reply,
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| P2pError::SocketClosed)?;
        rx.await.unwrap_or(Err(P2pError::SocketClosed))
    }

    /// Close the socket, force-closing every connection.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for EmiSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Connection plus the channels back to its handle.
struct Entry {
    id: ConnectionId,
    conn: Connection,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    status: watch::Sender<Status>,
    opened: Option<oneshot::Sender<Result<(), ConnectError>>>,
}

impl Entry {
    /// Publish status, connect result and events to the handle.
    fn dispatch(&mut self) {
        let status = Status {
            phase: self.conn.phase(),
            reason: self.conn.disconnect_reason(),
        };
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
        if let Some(result) = self.conn.take_open_result() {
            if let Some(opened) = self.opened.take() {
                let _ = opened.send(result);
            }
        }
        while let Some(event) = self.conn.poll_event() {
            let _ = self.events.send(event);
        }
    }
}

struct PendingP2p {
    attempt: P2pAttempt,
    reply: oneshot::Sender<Result<EmiConnection, P2pError>>,
}

/// Outbound path shared by every connection: rate limit, then fabricated drop.
struct Egress {
    limiter: RateLimiter,
    dropper: PacketDropper,
    queue: Vec<(SocketAddr, Vec<u8>)>,
}

impl Egress {
    fn ready(&mut self, now: Instant) -> bool {
        self.limiter.ready(now)
    }

    fn push(&mut self, to: SocketAddr, datagram: Vec<u8>) {
        self.limiter.consume();
        if self.dropper.should_drop() {
            trace!(%to, len = datagram.len(), "fabricated drop");
            return;
        }
        self.queue.push((to, datagram));
    }
}

struct Driver {
    config: SocketConfig,
    params: ConnectionParams,
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    incoming: mpsc::Sender<EmiConnection>,
    connections: HashMap<SocketAddr, Entry>,
    ids: HashMap<ConnectionId, SocketAddr>,
    /// Other authenticated addresses of P2P peers, mapped to the address the
    /// connection is keyed by.
    aliases: HashMap<SocketAddr, SocketAddr>,
    next_id: ConnectionId,
    /// Rotates which connection transmits first.
    cursor: usize,
    attempts: Vec<PendingP2p>,
    strays: Vec<(SocketAddr, Vec<u8>)>,
    egress: Egress,
}

impl Driver {
    fn new(
        config: SocketConfig,
        local_addr: SocketAddr,
        commands: mpsc::Sender<Command>,
        incoming: mpsc::Sender<EmiConnection>,
    ) -> Self {
        let egress = Egress {
            limiter: RateLimiter::new(config.rate_limit, Instant::now()),
            dropper: PacketDropper::new(config.fabricated_packet_drop_rate),
            queue: Vec::new(),
        };
        Self {
            params: config.connection_params(),
            config,
            local_addr,
            commands,
            incoming,
            connections: HashMap::new(),
            ids: HashMap::new(),
            aliases: HashMap::new(),
            next_id: 1,
            cursor: 0,
            attempts: Vec::new(),
            strays: Vec::new(),
            egress,
        }
    }

    async fn run(
        mut self,
        socket: DatagramSocket,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut buf = vec![0u8; DEFAULT_RECV_BUFFER_SIZE];
        loop {
            for (to, datagram) in self.drive(Instant::now()) {
                if let Err(e) = socket.send_to(&datagram, to).await {
                    warn!(%to, error = %e, "send failed");
                }
            }
            let wake_at = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);

            tokio::select! {
                _ = &mut shutdown => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, Instant::now()),
                    None => break,
                },
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from, Instant::now()),
                    Err(e) => warn!(error = %e, "receive failed"),
                },
                _ = time::sleep_until(time::Instant::from_std(wake_at)) => {}
            }
        }
        self.shutdown();
        debug!(local_addr = %self.local_addr, "socket closed");
    }

    /// Apply timers, collect outgoing datagrams, deliver events and drop
    /// closed connections.
    fn drive(&mut self, now: Instant) -> Vec<(SocketAddr, Vec<u8>)> {
        for pending in &mut self.attempts {
            pending.attempt.handle_timeout(now);
        }
        for entry in self.connections.values_mut() {
            entry.conn.handle_timeout(now);
        }

        for (to, datagram) in mem::take(&mut self.strays) {
            if self.egress.ready(now) {
                self.egress.push(to, datagram);
            } else {
                trace!(%to, "rate limited, dropping reply");
            }
        }
        for pending in &mut self.attempts {
            while self.egress.ready(now) {
                let Some((to, datagram)) = pending.attempt.poll_transmit(now) else {
                    break;
                };
                self.egress.push(to, datagram);
            }
        }
        // One datagram per connection per pass, so a busy connection cannot
        // take every token.
        let mut order = self.transmit_order();
        let mut next = 0;
        while !order.is_empty() && self.egress.ready(now) {
            next %= order.len();
            let peer = order[next];
            let datagram = self
                .connections
                .get_mut(&peer)
                .and_then(|entry| entry.conn.poll_transmit(now));
            match datagram {
                Some(datagram) => {
                    self.egress.push(peer, datagram);
                    next += 1;
                }
                None => {
                    order.remove(next);
                }
            }
        }

        let (done, pending): (Vec<_>, Vec<_>) = mem::take(&mut self.attempts)
            .into_iter()
            .partition(|p| p.attempt.is_done());
        self.attempts = pending;
        for mut finished in done {
            if let Some(error) = finished.attempt.take_failure() {
                let _ = finished.reply.send(Err(error));
            }
        }

        for entry in self.connections.values_mut() {
            entry.dispatch();
        }
        let closed: Vec<SocketAddr> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.conn.is_closed())
            .map(|(peer, _)| *peer)
            .collect();
        for peer in closed {
            self.remove(peer);
        }

        mem::take(&mut self.egress.queue)
    }

    /// Connection keys in address order, rotated by one every call.
    fn transmit_order(&mut self) -> Vec<SocketAddr> {
        let mut peers: Vec<SocketAddr> = self.connections.keys().copied().collect();
        peers.sort_unstable();
        if !peers.is_empty() {
            let len = peers.len();
            peers.rotate_left(self.cursor % len);
        }
        self.cursor = self.cursor.wrapping_add(1);
        peers
    }

    fn next_deadline(&self) -> Option<Instant> {
        let deadline = self
            .connections
            .values()
            .filter_map(|entry| entry.conn.next_timeout())
            .chain(self.attempts.iter().filter_map(|p| p.attempt.next_timeout()))
            .min()?;
        Some(match self.egress.limiter.next_ready() {
            Some(ready) => deadline.max(ready),
            None => deadline,
        })
    }

    fn handle_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Connect { peer, reply } => {
                let _ = reply.send(self.connect(peer, now));
            }
            Command::ConnectP2p {
                mediator,
                cookie,
                secret,
                reply,
            } => {
                debug!(%mediator, "starting p2p rendezvous");
                let attempt = P2pAttempt::new(
                    mediator,
                    cookie,
                    secret,
                    self.local_addr,
                    rand::random(),
                    self.config.connection_timeout,
                    now,
                );
                self.attempts.push(PendingP2p { attempt, reply });
            }
            Command::Send {
                id,
                channel,
                priority,
                data,
                reply,
            } => {
                let result = match self.entry(id) {
                    Some(entry) => entry.conn.send_with_priority(channel, priority, data, now),
                    None => Err(ConnectionError::Closed),
                };
                let _ = reply.send(result);
            }
            Command::Flush { id, reply } => {
                let result = match self.entry(id) {
                    Some(entry) => entry.conn.flush(now),
                    None => Err(ConnectionError::Closed),
                };
                let _ = reply.send(result);
            }
            Command::Close { id, timeout, reply } => {
                if let Some(entry) = self.entry(id) {
                    match timeout {
                        Some(timeout) => entry.conn.close_or_force_close(timeout, now),
                        None => entry.conn.close(now),
                    }
                }
                let _ = reply.send(());
            }
            Command::ForceClose { id, reply } => {
                if let Some(entry) = self.entry(id) {
                    entry.conn.force_close();
                }
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self, peer: SocketAddr, now: Instant) -> Result<Connecting, ConnectError> {
        if self.connections.contains_key(&peer) {
            return Err(ConnectError::AlreadyConnected(peer));
        }
        debug!(%peer, "connecting");
        let conn = Connection::connect(peer, rand::random(), self.params.clone(), now);
        let (opened_tx, opened_rx) = oneshot::channel();
        let handle = self.register(conn);
        if let Some(entry) = self.connections.get_mut(&peer) {
            entry.opened = Some(opened_tx);
        }
        Ok(Connecting::new(handle, opened_rx))
    }

    fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) {
        if is_rendezvous(datagram) {
            match RendezvousMessage::decode(datagram) {
                Ok(message) => {
                    for pending in self
                        .attempts
                        .iter_mut()
                        .filter(|p| p.attempt.session() == message.session())
                    {
                        pending
                            .attempt
                            .handle_rendezvous(from, message.clone(), now);
                    }
                }
                Err(e) => trace!(%from, error = %e, "dropping rendezvous datagram"),
            }
            return;
        }

        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(%from, error = %e, "dropping malformed datagram");
                return;
            }
        };

        let key = match self.aliases.get(&from) {
            Some(&key) if !self.connections.contains_key(&from) => key,
            _ => from,
        };
        if let Some(entry) = self.connections.get_mut(&key) {
            if !entry.conn.is_restarted_by(&packet) {
                entry.conn.handle_packet(packet, now);
                return;
            }
            debug!(peer = %from, "peer restarted, replacing connection");
            entry.conn.abort(DisconnectReason::OtherHostClosed);
            entry.dispatch();
            self.remove(key);
        }
        self.handle_unknown(packet, from, now);
    }

    fn handle_unknown(&mut self, packet: Packet, from: SocketAddr, now: Instant) {
        let handshake = packet.messages.iter().find(|m| {
            m.flags.is_prx() && matches!(m.kind(), MessageKind::Syn | MessageKind::SynRst)
        });
        if let Some(message) = handshake {
            self.handle_p2p_handshake(message, from, now);
            return;
        }

        let syn = packet
            .find(MessageKind::Syn)
            .filter(|m| !m.flags.is_ack() && m.payload.is_empty());
        if let Some(peer_isn) = syn.and_then(|m| m.seq) {
            self.handle_connection_request(peer_isn, from, now);
            return;
        }

        if packet.find(MessageKind::Rst).is_some() {
            trace!(%from, "close from unknown peer, acknowledging");
            self.reply_stray(from, MessageFlags::CLOSE_ACK);
            return;
        }
        trace!(%from, "dropping datagram from unknown peer");
    }

    fn handle_p2p_handshake(&mut self, message: &Message, from: SocketAddr, now: Instant) {
        let accepted = self.attempts.iter_mut().enumerate().find_map(|(i, p)| {
            p.attempt
                .accept_handshake(from, message)
                .map(|handshake| (i, handshake))
        });
        let Some((index, handshake)) = accepted else {
            trace!(%from, "dropping unsolicited handshake");
            return;
        };
        let pending = self.attempts.swap_remove(index);
        let conn = Connection::p2p(
            from,
            handshake.local_isn,
            handshake.peer_isn,
            handshake.key,
            handshake.answer_syn,
            self.params.clone(),
            now,
        );
        debug!(peer = %from, "p2p connection established");
        for candidate in handshake.candidates {
            if candidate != from {
                self.aliases.insert(candidate, from);
            }
        }
        let handle = self.register(conn);
        if pending.reply.send(Ok(handle)).is_err() {
            if let Some(entry) = self.connections.get_mut(&from) {
                entry.conn.force_close();
            }
        }
    }

    fn handle_connection_request(&mut self, peer_isn: u16, from: SocketAddr, now: Instant) {
        if !self.config.accept_connections {
            trace!(%from, "not listening, dropping connection request");
            return;
        }
        if self.connections.len() >= self.config.max_connections {
            debug!(%from, "connection limit reached, refusing");
            self.reply_stray(from, MessageFlags::RST);
            return;
        }
        let conn = Connection::accept(from, rand::random(), peer_isn, self.params.clone(), now);
        let handle = self.register(conn);
        if self.incoming.try_send(handle).is_err() {
            debug!(%from, "accept queue full, refusing");
            self.remove(from);
            self.reply_stray(from, MessageFlags::RST);
            return;
        }
        debug!(peer = %from, "accepted connection");
    }

    fn reply_stray(&mut self, to: SocketAddr, flags: MessageFlags) {
        let datagram = Packet::stray(Message::control(flags, 0)).encode();
        self.strays.push((to, datagram));
    }

    fn register(&mut self, conn: Connection) -> EmiConnection {
        let id = self.next_id;
        self.next_id += 1;
        let peer = conn.peer();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status {
            phase: conn.phase(),
            reason: None,
        });
        let handle = EmiConnection::new(
            id,
            peer,
            self.local_addr,
            self.commands.clone(),
            events_rx,
            status_rx,
        );
        self.ids.insert(id, peer);
        self.connections.insert(
            peer,
            Entry {
                id,
                conn,
                events: events_tx,
                status: status_tx,
                opened: None,
            },
        );
        handle
    }

    fn remove(&mut self, peer: SocketAddr) {
        if let Some(entry) = self.connections.remove(&peer) {
            self.ids.remove(&entry.id);
        }
        self.aliases.retain(|_, key| *key != peer);
    }

    fn entry(&mut self, id: ConnectionId) -> Option<&mut Entry> {
        let peer = self.ids.get(&id)?;
        self.connections
            .get_mut(peer)
            .filter(|entry| entry.id == id)
    }

    fn shutdown(&mut self) {
        for entry in self.connections.values_mut() {
            entry.conn.abort(DisconnectReason::ThisHostClosed);
            entry.dispatch();
        }
        self.connections.clear();
        self.ids.clear();
        self.aliases.clear();
        for pending in self.attempts.drain(..) {
            let _ = pending.reply.send(Err(P2pError::SocketClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::{Future, ready};
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::time::timeout;

    use super::*;
    use crate::core::{ChannelQualifier, ChannelType, RendezvousFailure};
    use crate::crypto::CookieMint;
    use crate::p2p::{MediatorConfig, MediatorSocket};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const WAIT: Duration = Duration::from_secs(10);
    const LOSSY_WAIT: Duration = Duration::from_secs(120);

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn config(listen: bool) -> SocketConfig {
        SocketConfig::builder()
            .address(LOCALHOST)
            .accept_connections(listen)
            .tick_interval(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    fn short_timeout_config(listen: bool) -> SocketConfig {
        SocketConfig::builder()
            .address(LOCALHOST)
            .accept_connections(listen)
            .heartbeat_interval(Duration::from_millis(100))
            .connection_timeout(Duration::from_millis(500))
            .build()
            .unwrap()
    }

    fn lossy_config(listen: bool) -> SocketConfig {
        SocketConfig::builder()
            .address(LOCALHOST)
            .accept_connections(listen)
            .tick_interval(Duration::from_millis(10))
            .rate_limit(50)
            .fabricated_packet_drop_rate(0.3)
            .build()
            .unwrap()
    }

    /// A socket task's state without the task, driven by hand.
    fn driver(config: SocketConfig, local_addr: SocketAddr) -> Driver {
        let (commands, _) = mpsc::channel(COMMAND_QUEUE);
        let (incoming, _) = mpsc::channel(config.max_connections);
        Driver::new(config, local_addr, commands, incoming)
    }

    /// Connect over a lossy path, starting over when every SYN or SYN-RST of
    /// an attempt was dropped.
    async fn connect_lossy(
        client: &EmiSocket,
        incoming: &mut Incoming,
        server: SocketAddr,
    ) -> (EmiConnection, EmiConnection) {
        let conn = loop {
            match client.connect(server).await {
                Ok(conn) => break conn,
                Err(ConnectError::TimedOut) => continue,
                Err(e) => panic!("connect failed: {e}"),
            }
        };
        // Earlier attempts the server accepted were replaced and are closed.
        let accepted = loop {
            let accepted = incoming.accept().await.expect("server socket open");
            if accepted.is_open() {
                break accepted;
            }
        };
        (conn, accepted)
    }

    async fn next_message(conn: &mut EmiConnection) -> (ChannelQualifier, Vec<u8>) {
        loop {
            match conn.next_event().await {
                Some(ConnectionEvent::Message { channel, data }) => return (channel, data),
                Some(_) => {}
                None => panic!("connection closed before a message arrived"),
            }
        }
    }

    async fn next_disconnect(conn: &mut EmiConnection) -> DisconnectReason {
        loop {
            match conn.next_event().await {
                Some(ConnectionEvent::Disconnected(reason)) => return reason,
                Some(_) => {}
                None => panic!("event stream ended without Disconnected"),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_exchange_and_close() {
        let (server, mut incoming) = EmiSocket::open(config(true)).await.unwrap();
        let (client, _) = EmiSocket::open(config(false)).await.unwrap();

        let mut conn = timeout(WAIT, client.connect(server.local_addr()))
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.remote_addr(), server.local_addr());

        let mut accepted = timeout(WAIT, incoming.accept()).await.unwrap().unwrap();
        assert_eq!(accepted.remote_addr(), client.local_addr());

        let channel = ChannelQualifier::new(ChannelType::ReliableOrdered, 2).unwrap();
        conn.send(channel, b"ping".to_vec()).await.unwrap();
        let (got_channel, data) = timeout(WAIT, next_message(&mut accepted)).await.unwrap();
        assert_eq!(got_channel, channel);
        assert_eq!(data, b"ping");

        accepted.send(channel, b"pong".to_vec()).await.unwrap();
        let (_, data) = timeout(WAIT, next_message(&mut conn)).await.unwrap();
        assert_eq!(data, b"pong");

        conn.close().await;
        assert_eq!(
            timeout(WAIT, conn.closed()).await.unwrap(),
            DisconnectReason::ThisHostClosed
        );
        assert_eq!(
            timeout(WAIT, next_disconnect(&mut accepted)).await.unwrap(),
            DisconnectReason::OtherHostClosed
        );
        assert_eq!(conn.send(channel, b"late".to_vec()).await, Err(ConnectionError::Closed));
    }

    #[tokio::test]
    async fn test_ordered_burst_arrives_in_order() {
        let (server, mut incoming) = EmiSocket::open(config(true)).await.unwrap();
        let (client, _) = EmiSocket::open(config(false)).await.unwrap();
        let conn = timeout(WAIT, client.connect(server.local_addr()))
            .await
            .unwrap()
            .unwrap();
        let mut accepted = timeout(WAIT, incoming.accept()).await.unwrap().unwrap();

        for i in 0u8..20 {
            conn.send(ChannelQualifier::DEFAULT, vec![i; 100]).await.unwrap();
        }
        for i in 0u8..20 {
            let (_, data) = timeout(WAIT, next_message(&mut accepted)).await.unwrap();
            assert_eq!(data, vec![i; 100]);
        }
    }

    #[tokio::test]
    async fn test_connect_times_out_when_not_listening() {
        let (quiet, _) = EmiSocket::open(short_timeout_config(false)).await.unwrap();
        let (client, _) = EmiSocket::open(short_timeout_config(false)).await.unwrap();

        let connecting = client.begin_connect(quiet.local_addr()).await.unwrap();
        assert!(connecting.connection().is_opening());
        let result = timeout(WAIT, connecting.established()).await.unwrap();
        assert!(matches!(result, Err(ConnectError::TimedOut)));
    }

    #[tokio::test]
    async fn test_connection_limit_rejects() {
        let config = SocketConfig::builder()
            .address(LOCALHOST)
            .accept_connections(true)
            .max_connections(1)
            .build()
            .unwrap();
        let (server, _incoming) = EmiSocket::open(config).await.unwrap();
        let (first, _) = EmiSocket::open(short_timeout_config(false)).await.unwrap();
        let (second, _) = EmiSocket::open(short_timeout_config(false)).await.unwrap();

        let _conn = timeout(WAIT, first.connect(server.local_addr()))
            .await
            .unwrap()
            .unwrap();
        let result = timeout(WAIT, second.connect(server.local_addr())).await.unwrap();
        assert!(matches!(result, Err(ConnectError::Rejected)));
    }

    #[tokio::test]
    async fn test_already_connected() {
        let (quiet, _) = EmiSocket::open(config(false)).await.unwrap();
        let (client, _) = EmiSocket::open(config(false)).await.unwrap();

        let _pending = client.begin_connect(quiet.local_addr()).await.unwrap();
        let second = client.begin_connect(quiet.local_addr()).await;
        assert!(matches!(second, Err(ConnectError::AlreadyConnected(a)) if a == quiet.local_addr()));
    }

    #[tokio::test]
    async fn test_close_cancels_pending_connect() {
        let (quiet, _) = EmiSocket::open(config(false)).await.unwrap();
        let (client, _) = EmiSocket::open(config(false)).await.unwrap();

        let connecting = client.begin_connect(quiet.local_addr()).await.unwrap();
        connecting.connection().close().await;
        let result = timeout(WAIT, connecting.established()).await.unwrap();
        assert!(matches!(result, Err(ConnectError::Cancelled)));
    }

    #[tokio::test]
    async fn test_socket_close_ends_connections() {
        let (server, mut incoming) = EmiSocket::open(config(true)).await.unwrap();
        let (client, _) = EmiSocket::open(config(false)).await.unwrap();
        let mut conn = timeout(WAIT, client.connect(server.local_addr()))
            .await
            .unwrap()
            .unwrap();
        let _accepted = timeout(WAIT, incoming.accept()).await.unwrap().unwrap();

        client.close();
        assert_eq!(
            timeout(WAIT, next_disconnect(&mut conn)).await.unwrap(),
            DisconnectReason::ThisHostClosed
        );
        assert_eq!(conn.send(ChannelQualifier::DEFAULT, b"x".to_vec()).await, Err(ConnectionError::Closed));
    }

    struct FailingResolver;

    impl Resolve for FailingResolver {
        fn resolve(&self, _host: &str, _port: u16)
        -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send {
            ready(Err(io::Error::new(io::ErrorKind::NotFound, "no such host")))
        }
    }

    #[tokio::test]
    async fn test_connect_host() {
        let (server, _incoming) = EmiSocket::open(config(true)).await.unwrap();
        let (client, _) = EmiSocket::open(config(false)).await.unwrap();

        let conn = timeout(
            WAIT,
            client.connect_host("127.0.0.1", server.local_port(), &crate::transport::SystemResolver),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(conn.remote_addr(), server.local_addr());

        let failed = client.connect_host("nowhere.invalid", 1, &FailingResolver).await;
        assert!(matches!(failed, Err(ConnectError::DnsResolutionFailed(h)) if h == "nowhere.invalid"));
    }

    #[tokio::test]
    async fn test_p2p_through_mediator() {
        let mediator = MediatorSocket::open(MediatorConfig::default().with_address(LOCALHOST))
            .await
            .unwrap();
        let (cookie_a, cookie_b) = mediator.generate_cookie_pair().unwrap();
        let secret = mediator.generate_shared_secret();

        let (peer_a, _) = EmiSocket::open(config(false)).await.unwrap();
        let (peer_b, _) = EmiSocket::open(config(false)).await.unwrap();

        let (a, b) = timeout(WAIT, async {
            tokio::join!(
                peer_a.connect_p2p(mediator.local_addr(), cookie_a, secret.clone()),
                peer_b.connect_p2p(mediator.local_addr(), cookie_b, secret.clone()),
            )
        })
        .await
        .unwrap();
        let a = a.unwrap();
        let mut b = b.unwrap();
        assert_eq!(a.remote_addr(), peer_b.local_addr());
        assert_eq!(b.remote_addr(), peer_a.local_addr());

        let channel = ChannelQualifier::new(ChannelType::ReliableOrdered, 7).unwrap();
        a.send(channel, b"through the hole".to_vec()).await.unwrap();
        let (_, data) = timeout(WAIT, next_message(&mut b)).await.unwrap();
        assert_eq!(data, b"through the hole");
    }

    #[tokio::test]
    async fn test_p2p_consumed_cookie() {
        let mediator = MediatorSocket::open(MediatorConfig::default().with_address(LOCALHOST))
            .await
            .unwrap();
        let cookie = mediator.generate_cookie().unwrap();
        let secret = mediator.generate_shared_secret();

        let (peer_a, _) = EmiSocket::open(config(false)).await.unwrap();
        let (peer_b, _) = EmiSocket::open(config(false)).await.unwrap();
        let (late, _) = EmiSocket::open(config(false)).await.unwrap();

        let (a, b) = timeout(WAIT, async {
            tokio::join!(
                peer_a.connect_p2p(mediator.local_addr(), cookie.clone(), secret.clone()),
                peer_b.connect_p2p(mediator.local_addr(), cookie.clone(), secret.clone()),
            )
        })
        .await
        .unwrap();
        assert!(a.is_ok() && b.is_ok());

        let result = timeout(WAIT, late.connect_p2p(mediator.local_addr(), cookie, secret))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(P2pError::RendezvousFailed(RendezvousFailure::CookieConsumed))
        ));
    }

    #[tokio::test]
    async fn test_p2p_unreachable_mediator() {
        let mediator = MediatorSocket::open(MediatorConfig::default().with_address(LOCALHOST))
            .await
            .unwrap();
        let cookie = mediator.generate_cookie().unwrap();
        let secret = mediator.generate_shared_secret();
        let silent = DatagramSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();

        let (peer, _) = EmiSocket::open(short_timeout_config(false)).await.unwrap();
        let result = timeout(
            WAIT,
            peer.connect_p2p(silent.local_addr().unwrap(), cookie, secret),
        )
        .await
        .unwrap();
        assert!(matches!(
            result,
            Err(P2pError::RendezvousFailed(RendezvousFailure::MediatorUnreachable))
        ));
    }

    #[tokio::test]
    async fn test_rate_limited_lossy_delivery() {
        let (server, mut incoming) = EmiSocket::open(lossy_config(true)).await.unwrap();
        let (client, _) = EmiSocket::open(lossy_config(false)).await.unwrap();
        let (conn, mut accepted) = timeout(
            LOSSY_WAIT,
            connect_lossy(&client, &mut incoming, server.local_addr()),
        )
        .await
        .unwrap();

        let channel = ChannelQualifier::DEFAULT;
        for i in 0..30u8 {
            conn.send(channel, vec![i; 32]).await.unwrap();
        }
        let received = timeout(LOSSY_WAIT, async {
            let mut got = Vec::new();
            while got.len() < 30 {
                let (_, data) = next_message(&mut accepted).await;
                got.push(data[0]);
            }
            got
        })
        .await
        .unwrap();
        assert_eq!(received, (0..30).collect::<Vec<u8>>());

        // Retransmissions still in flight must not show up twice.
        time::sleep(Duration::from_millis(500)).await;
        while let Some(event) = accepted.try_next_event() {
            assert!(
                !matches!(event, ConnectionEvent::Message { .. }),
                "duplicate delivery: {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_rate_limit_shared_by_connections() {
        let limited = SocketConfig::builder()
            .address(LOCALHOST)
            .accept_connections(true)
            .tick_interval(Duration::from_millis(10))
            .rate_limit(20)
            .build()
            .unwrap();
        let (server, mut incoming) = EmiSocket::open(limited).await.unwrap();
        let (client_a, _) = EmiSocket::open(config(false)).await.unwrap();
        let (client_b, _) = EmiSocket::open(config(false)).await.unwrap();

        let mut conn_a = timeout(WAIT, client_a.connect(server.local_addr()))
            .await
            .unwrap()
            .unwrap();
        let mut conn_b = timeout(WAIT, client_b.connect(server.local_addr()))
            .await
            .unwrap()
            .unwrap();
        let mut accepted = Vec::new();
        for _ in 0..2 {
            accepted.push(timeout(WAIT, incoming.accept()).await.unwrap().unwrap());
        }
        accepted.sort_by_key(|c| c.remote_addr() != client_a.local_addr());
        let (to_a, to_b) = (&accepted[0], &accepted[1]);
        assert_eq!(to_b.remote_addr(), client_b.local_addr());

        // Each message fills a datagram: 14 datagrams at 20 per second.
        let channel = ChannelQualifier::DEFAULT;
        let start = Instant::now();
        for i in 0..7u8 {
            to_a.send(channel, vec![i; 1000]).await.unwrap();
            to_b.send(channel, vec![i; 1000]).await.unwrap();
        }
        let (got_a, got_b) = timeout(WAIT, async {
            let mut got_a = Vec::new();
            let mut got_b = Vec::new();
            while got_a.len() < 7 || got_b.len() < 7 {
                tokio::select! {
                    (_, data) = next_message(&mut conn_a), if got_a.len() < 7 => got_a.push(data[0]),
                    (_, data) = next_message(&mut conn_b), if got_b.len() < 7 => got_b.push(data[0]),
                }
            }
            (got_a, got_b)
        })
        .await
        .unwrap();
        assert_eq!(got_a, (0..7).collect::<Vec<u8>>());
        assert_eq!(got_b, (0..7).collect::<Vec<u8>>());
        // Two tokens of burst, then one every 50 ms.
        assert!(start.elapsed() >= Duration::from_millis(500), "{:?}", start.elapsed());
    }

    #[test]
    fn test_rate_limited_connections_take_turns() {
        let limited = SocketConfig::builder()
            .address(LOCALHOST)
            .rate_limit(10)
            .build()
            .unwrap();
        let mut driver = driver(limited, addr("127.0.0.1:4000"));
        let now = Instant::now();
        let peers = [addr("127.0.0.1:5001"), addr("127.0.0.1:5002")];
        let mut handles = Vec::new();
        for peer in peers {
            let mut conn = Connection::accept(peer, 1, 100, driver.params.clone(), now);
            for i in 0..3u8 {
                conn.send(ChannelQualifier::DEFAULT, vec![i; 1000], now).unwrap();
            }
            conn.flush(now).unwrap();
            handles.push(driver.register(conn));
        }

        // One token per 100 ms; both connections always have datagrams ready.
        let mut sent = Vec::new();
        for i in 0..6u32 {
            let out = driver.drive(now + Duration::from_millis(100) * i);
            sent.extend(out.into_iter().map(|(to, _)| to));
        }
        assert_eq!(sent.len(), 6);
        for peer in peers {
            assert_eq!(sent.iter().filter(|&&to| to == peer).count(), 3);
        }
    }

    #[test]
    fn test_p2p_converges_behind_shared_nat() {
        let mediator = addr("198.51.100.1:7000");
        let a_inner = addr("192.168.1.10:4000");
        let a_outer = addr("203.0.113.5:40000");
        let b_inner = addr("192.168.1.11:5000");
        let b_outer = addr("203.0.113.5:50000");

        let (cookie_a, cookie_b) = CookieMint::generate().mint_pair(0).unwrap();
        let session = *cookie_a.nonce();
        let secret = SharedSecret::generate();
        let mut a = driver(config(false), a_inner);
        let mut b = driver(config(false), b_inner);
        let now = Instant::now();

        let (reply, mut opened_a) = oneshot::channel();
        a.handle_command(
            Command::ConnectP2p { mediator, cookie: cookie_a, secret: secret.clone(), reply },
            now,
        );
        let (reply, mut opened_b) = oneshot::channel();
        b.handle_command(
            Command::ConnectP2p { mediator, cookie: cookie_b, secret, reply },
            now,
        );
        let matched = |role, your_outer, peer_inner, peer_outer| {
            RendezvousMessage::Matched {
                session,
                role,
                your_outer,
                peer_inner,
                peer_outer,
            }
            .encode()
        };
        a.handle_datagram(&matched(0, a_outer, b_inner, b_outer), mediator, now);
        b.handle_datagram(&matched(1, b_outer, a_inner, a_outer), mediator, now);

        // Both sides punch the other's outer and inner address.
        let punch_a = a.drive(now);
        let punch_b = b.drive(now);
        let to = |out: &[(SocketAddr, Vec<u8>)], dst: SocketAddr| {
            out.iter()
                .find(|(to, _)| *to == dst)
                .map(|(_, datagram)| datagram.clone())
                .unwrap()
        };
        // B first hears A through the hairpin, A first hears B on the LAN.
        b.handle_datagram(&to(&punch_a, b_outer), a_outer, now);
        a.handle_datagram(&to(&punch_b, a_inner), b_inner, now);
        b.handle_datagram(&to(&punch_a, b_inner), a_inner, now);
        a.handle_datagram(&to(&punch_b, a_outer), b_outer, now);

        let mut conn_a = opened_a.try_recv().unwrap().unwrap();
        let mut conn_b = opened_b.try_recv().unwrap().unwrap();
        assert_eq!(conn_a.remote_addr(), b_inner);
        assert_eq!(conn_b.remote_addr(), a_outer);

        let channel = ChannelQualifier::new(ChannelType::ReliableOrdered, 3).unwrap();
        let entry = a.entry(conn_a.id()).unwrap();
        entry.conn.send(channel, b"from a".to_vec(), now).unwrap();
        let entry = b.entry(conn_b.id()).unwrap();
        entry.conn.send(channel, b"from b".to_vec(), now).unwrap();

        // A datagram to an outer address arrives from the sender's outer one.
        let mut t = now;
        for _ in 0..100 {
            t += Duration::from_millis(10);
            for (to, datagram) in a.drive(t) {
                let from = if to == b_outer { a_outer } else { a_inner };
                b.handle_datagram(&datagram, from, t);
            }
            for (to, datagram) in b.drive(t) {
                let from = if to == a_outer { b_outer } else { b_inner };
                a.handle_datagram(&datagram, from, t);
            }
        }
        a.drive(t);
        b.drive(t);

        let messages = |conn: &mut EmiConnection| {
            std::iter::from_fn(|| conn.try_next_event())
                .filter_map(|event| match event {
                    ConnectionEvent::Message { data, .. } => Some(data),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(messages(&mut conn_b), vec![b"from a".to_vec()]);
        assert_eq!(messages(&mut conn_a), vec![b"from b".to_vec()]);
        assert!(conn_a.is_open() && conn_b.is_open());
    }
}
