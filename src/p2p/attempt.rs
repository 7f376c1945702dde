//! Peer side of a mediated P2P rendezvous.
//!
//! A [`P2pAttempt`] registers with the mediator until it is matched, then
//! punches authenticated SYNs at the other peer's candidate addresses until
//! an authenticated handshake message comes back. It is sans-IO like
//! [`Connection`](crate::transport::Connection); the socket task routes
//! rendezvous replies and unknown-peer handshakes to it.

use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::message::RendezvousMessage;
use crate::core::{COOKIE_NONCE_SIZE, MAX_RENDEZVOUS_INTERVAL, P2pError, RendezvousFailure};
use crate::crypto::{Cookie, HandshakeKey, SharedSecret};
use crate::transport::{Message, MessageFlags, MessageKind, Packet};

/// First retry interval for registration and punching.
pub const INITIAL_RENDEZVOUS_INTERVAL: Duration = Duration::from_millis(250);

/// Everything needed to create the P2P connection once the handshake
/// authenticated.
#[derive(Debug)]
pub struct Handshake {
    /// Key for answering further handshakes on the connection.
    pub key: HandshakeKey,
    /// Our initial sequence number.
    pub local_isn: u16,
    /// The peer's initial sequence number.
    pub peer_isn: u16,
    /// The message was a SYN and needs a SYN-RST answer.
    pub answer_syn: bool,
    /// Every candidate address of the peer, including the one the handshake
    /// came from. Traffic from any of them belongs to the connection.
    pub candidates: Vec<SocketAddr>,
}

#[derive(Debug)]
enum State {
    Registering {
        since: Instant,
        next_send: Instant,
        interval: Duration,
        answered: bool,
    },
    Punching {
        key: HandshakeKey,
        candidates: Vec<SocketAddr>,
        deadline: Instant,
        next_send: Instant,
        interval: Duration,
    },
    Done,
}

/// One `connect_p2p` in progress.
#[derive(Debug)]
pub struct P2pAttempt {
    mediator: SocketAddr,
    cookie: Cookie,
    secret: SharedSecret,
    inner: SocketAddr,
    local_isn: u16,
    timeout: Duration,
    state: State,
    outbox: VecDeque<(SocketAddr, Vec<u8>)>,
    failure: Option<P2pError>,
}

impl P2pAttempt {
    /// Start registering with `mediator`. `inner` is our own address as we
    /// see it; `timeout` bounds each of the two phases.
    pub fn new(
        mediator: SocketAddr,
        cookie: Cookie,
        secret: SharedSecret,
        inner: SocketAddr,
        local_isn: u16,
        timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            mediator,
            cookie,
            secret,
            inner,
            local_isn,
            timeout,
            state: State::Registering {
                since: now,
                next_send: now,
                interval: INITIAL_RENDEZVOUS_INTERVAL,
                answered: false,
            },
            outbox: VecDeque::new(),
            failure: None,
        }
    }

    /// Mediator address.
    pub fn mediator(&self) -> SocketAddr {
        self.mediator
    }

    /// Session nonce of the cookie.
    pub fn session(&self) -> &[u8; COOKIE_NONCE_SIZE] {
        self.cookie.nonce()
    }

    /// Whether the peers have been matched and punching is under way.
    pub fn is_punching(&self) -> bool {
        matches!(self.state, State::Punching { .. })
    }

    /// Finished, successfully or not.
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// The failure, once reported.
    pub fn take_failure(&mut self) -> Option<P2pError> {
        self.failure.take()
    }

    /// Give up with `error`.
    pub fn fail(&mut self, error: P2pError) {
        if self.is_done() {
            return;
        }
        debug!(mediator = %self.mediator, %error, "p2p attempt failed");
        self.state = State::Done;
        self.outbox.clear();
        self.failure = Some(error);
    }

    /// Process a rendezvous message received from `from`.
    pub fn handle_rendezvous(&mut self, from: SocketAddr, message: RendezvousMessage, now: Instant) {
        if from != self.mediator || message.session() != self.cookie.nonce() {
            return;
        }
        let State::Registering { answered, .. } = &mut self.state else {
            return;
        };
        match message {
            RendezvousMessage::Waiting { .. } => {
                trace!(mediator = %self.mediator, "waiting for peer");
                *answered = true;
            }
            RendezvousMessage::Rejected { reason, .. } => {
                self.fail(P2pError::RendezvousFailed(reason));
            }
            RendezvousMessage::Matched {
                session,
                role,
                your_outer,
                peer_inner,
                peer_outer,
            } => {
                let mut candidates = vec![peer_outer];
                if your_outer.ip() == peer_outer.ip()
                    && peer_inner != peer_outer
                    && !peer_inner.ip().is_unspecified()
                {
                    candidates.push(peer_inner);
                }
                debug!(role, ?candidates, "matched, punching");
                self.state = State::Punching {
                    key: HandshakeKey::new(self.secret.clone(), session, role),
                    candidates,
                    deadline: now + self.timeout,
                    next_send: now,
                    interval: INITIAL_RENDEZVOUS_INTERVAL,
                };
            }
            RendezvousMessage::Register { .. } => {}
        }
    }

    /// Check a handshake message from an unknown peer. Returns the
    /// handshake when it is authentic and comes from a candidate address;
    /// the attempt is then done.
    pub fn accept_handshake(&mut self, from: SocketAddr, message: &Message) -> Option<Handshake> {
        let State::Punching {
            key, candidates, ..
        } = &self.state
        else {
            return None;
        };
        if !message.flags.is_prx()
            || !matches!(message.kind(), MessageKind::Syn | MessageKind::SynRst)
            || !candidates.contains(&from)
        {
            return None;
        }
        let peer_isn = message.seq?;
        if !key.verify(message.flags.as_byte(), peer_isn, &message.payload) {
            trace!(%from, "handshake tag did not verify");
            return None;
        }
        let State::Punching {
            key, candidates, ..
        } = mem::replace(&mut self.state, State::Done)
        else {
            return None;
        };
        self.outbox.clear();
        Some(Handshake {
            key,
            local_isn: self.local_isn,
            peer_isn,
            answer_syn: message.kind() == MessageKind::Syn,
            candidates,
        })
    }

    /// Apply the phase deadlines.
    pub fn handle_timeout(&mut self, now: Instant) {
        match &self.state {
            State::Registering {
                since, answered, ..
            } if now >= *since + self.timeout => {
                let reason = if *answered {
                    RendezvousFailure::TimedOut
                } else {
                    RendezvousFailure::MediatorUnreachable
                };
                self.fail(P2pError::RendezvousFailed(reason));
            }
            State::Punching { deadline, .. } if now >= *deadline => {
                self.fail(P2pError::HandshakeFailed);
            }
            _ => {}
        }
    }

    /// Next datagram to send and its destination.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<(SocketAddr, Vec<u8>)> {
        if let Some(out) = self.outbox.pop_front() {
            return Some(out);
        }
        match &mut self.state {
            State::Registering {
                next_send,
                interval,
                ..
            } if now >= *next_send => {
                *next_send = now + *interval;
                *interval = (*interval * 2).min(MAX_RENDEZVOUS_INTERVAL);
                let register = RendezvousMessage::Register {
                    cookie: self.cookie.clone(),
                    inner: self.inner,
                };
                Some((self.mediator, register.encode()))
            }
            State::Punching {
                key,
                candidates,
                next_send,
                interval,
                ..
            } if now >= *next_send => {
                *next_send = now + *interval;
                *interval = (*interval * 2).min(MAX_RENDEZVOUS_INTERVAL);
                let flags = MessageFlags::SYN.with_prx();
                let tag = match key.sign(flags.as_byte(), self.local_isn) {
                    Ok(tag) => tag,
                    Err(_) => {
                        self.fail(P2pError::HandshakeFailed);
                        return None;
                    }
                };
                let datagram =
                    Packet::stray(Message::handshake(MessageFlags::SYN, self.local_isn, tag))
                        .encode();
                for candidate in candidates.iter() {
                    self.outbox.push_back((*candidate, datagram.clone()));
                }
                self.outbox.pop_front()
            }
            _ => None,
        }
    }

    /// Earliest instant the attempt has work to do.
    pub fn next_timeout(&self) -> Option<Instant> {
        match &self.state {
            State::Registering {
                since, next_send, ..
            } => Some((*since + self.timeout).min(*next_send)),
            State::Punching {
                deadline,
                next_send,
                ..
            } => Some((*deadline).min(*next_send)),
            State::Done => None,
        }
    }
}
