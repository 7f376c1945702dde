//! Rendezvous messages exchanged between peers and the mediator.
//!
//! ```text
//! +------+------+-----------------------------------------------+
//! | 0x80 | type | body                                          |
//! +------+------+-----------------------------------------------+
//! Register (1): cookie[41] inner_addr
//! Waiting  (2): session[8]
//! Matched  (3): session[8] role:u8 your_outer peer_inner peer_outer
//! Rejected (4): session[8] reason:u8 (1 invalid cookie, 2 consumed)
//!
//! addr = family:u8 (4 | 6) ip[4 | 16] port:u16
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::core::{COOKIE_NONCE_SIZE, PACKET_FLAG_RENDEZVOUS, RendezvousFailure};
use crate::crypto::{COOKIE_SIZE, Cookie};
use crate::transport::FrameError;

const TYPE_REGISTER: u8 = 1;
const TYPE_WAITING: u8 = 2;
const TYPE_MATCHED: u8 = 3;
const TYPE_REJECTED: u8 = 4;

const REASON_INVALID_COOKIE: u8 = 1;
const REASON_COOKIE_CONSUMED: u8 = 2;

/// A rendezvous message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousMessage {
    /// Peer to mediator: present a cookie and our local endpoint.
    Register {
        /// Cookie handed out by the mediator.
        cookie: Cookie,
        /// The peer's own view of its address.
        inner: SocketAddr,
    },
    /// Mediator to peer: registered, the other side has not arrived yet.
    Waiting {
        /// Session nonce.
        session: [u8; COOKIE_NONCE_SIZE],
    },
    /// Mediator to peer: both sides are here.
    Matched {
        /// Session nonce.
        session: [u8; COOKIE_NONCE_SIZE],
        /// 0 for the first registrant, 1 for the second.
        role: u8,
        /// Address the mediator saw the recipient at.
        your_outer: SocketAddr,
        /// The other peer's self-reported address.
        peer_inner: SocketAddr,
        /// Address the mediator saw the other peer at.
        peer_outer: SocketAddr,
    },
    /// Mediator to peer: the cookie is not usable.
    Rejected {
        /// Session nonce of the rejected cookie.
        session: [u8; COOKIE_NONCE_SIZE],
        /// Why.
        reason: RendezvousFailure,
    },
}

impl RendezvousMessage {
    /// Session nonce the message refers to.
    pub fn session(&self) -> &[u8; COOKIE_NONCE_SIZE] {
        match self {
            Self::Register { cookie, .. } => cookie.nonce(),
            Self::Waiting { session }
            | Self::Matched { session, .. }
            | Self::Rejected { session, .. } => session,
        }
    }

    /// Serialize into a datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![PACKET_FLAG_RENDEZVOUS];
        match self {
            Self::Register { cookie, inner } => {
                buf.push(TYPE_REGISTER);
                buf.extend_from_slice(&cookie.to_bytes());
                put_addr(&mut buf, inner);
            }
            Self::Waiting { session } => {
                buf.push(TYPE_WAITING);
                buf.extend_from_slice(session);
            }
            Self::Matched {
                session,
                role,
                your_outer,
                peer_inner,
                peer_outer,
            } => {
                buf.push(TYPE_MATCHED);
                buf.extend_from_slice(session);
                buf.push(*role);
                put_addr(&mut buf, your_outer);
                put_addr(&mut buf, peer_inner);
                put_addr(&mut buf, peer_outer);
            }
            Self::Rejected { session, reason } => {
                buf.push(TYPE_REJECTED);
                buf.extend_from_slice(session);
                buf.push(match reason {
                    RendezvousFailure::CookieConsumed => REASON_COOKIE_CONSUMED,
                    _ => REASON_INVALID_COOKIE,
                });
            }
        }
        buf
    }

    /// Parse a datagram whose first byte has the rendezvous flag.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader { bytes, pos: 0 };
        let flags = r.u8()?;
        if flags != PACKET_FLAG_RENDEZVOUS {
            return Err(FrameError::InvalidPacketFlags(flags));
        }
        let message = match r.u8()? {
            TYPE_REGISTER => {
                let cookie = Cookie::from_bytes(r.take(COOKIE_SIZE)?).map_err(|_| {
                    FrameError::TooShort {
                        expected: COOKIE_SIZE,
                        actual: bytes.len(),
                    }
                })?;
                Self::Register {
                    cookie,
                    inner: r.addr()?,
                }
            }
            TYPE_WAITING => Self::Waiting {
                session: r.session()?,
            },
            TYPE_MATCHED => Self::Matched {
                session: r.session()?,
                role: r.u8()? & 1,
                your_outer: r.addr()?,
                peer_inner: r.addr()?,
                peer_outer: r.addr()?,
            },
            TYPE_REJECTED => {
                let session = r.session()?;
                let reason = match r.u8()? {
                    REASON_COOKIE_CONSUMED => RendezvousFailure::CookieConsumed,
                    _ => RendezvousFailure::InvalidCookie,
                };
                Self::Rejected { session, reason }
            }
            other => return Err(FrameError::InvalidRendezvousType(other)),
        };
        if r.pos != bytes.len() {
            return Err(FrameError::UnexpectedPayload(bytes.len() - r.pos));
        }
        Ok(message)
    }
}

fn put_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        let end = self.pos + n;
        let slice = self.bytes.get(self.pos..end).ok_or(FrameError::TooShort {
            expected: end,
            actual: self.bytes.len(),
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn session(&mut self) -> Result<[u8; COOKIE_NONCE_SIZE], FrameError> {
        let mut session = [0u8; COOKIE_NONCE_SIZE];
        session.copy_from_slice(self.take(COOKIE_NONCE_SIZE)?);
        Ok(session)
    }

    fn addr(&mut self) -> Result<SocketAddr, FrameError> {
        let ip = match self.u8()? {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(self.take(4)?);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.take(16)?);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(FrameError::InvalidAddressFamily(other)),
        };
        let port = self.take(2)?;
        Ok(SocketAddr::new(ip, u16::from_le_bytes([port[0], port[1]])))
    }
}
