//! EMI - Peer-to-peer rendezvous
//!
//! Two peers behind NAT meet through a mediator:
//!
//! 1. The application obtains a cookie pair and a shared secret from a
//!    [`MediatorSocket`] and hands one cookie to each peer.
//! 2. Each peer registers its cookie with the mediator ([`P2pAttempt`]).
//! 3. The mediator pairs the registrations and tells each side where the other
//!    one is ([`RendezvousMessage::Matched`]).
//! 4. Both peers punch holes with authenticated SYNs; the first valid one wins.

mod attempt;
mod mediator;
mod message;

pub use attempt::{Handshake, INITIAL_RENDEZVOUS_INTERVAL, P2pAttempt};
pub use mediator::{MediatorConfig, MediatorSocket, MediatorState, SESSION_LIFETIME};
pub use message::RendezvousMessage;
