//! EMI - Crypto Layer
//!
//! Tokens the mediator hands out and the authentication of the P2P
//! handshake:
//!
//! - [`Cookie`] / [`CookieMint`]: MAC-protected rendezvous cookies
//! - [`SharedSecret`]: 32-byte secret given to both peers
//! - [`HandshakeKey`]: tags P2P handshake messages with the shared secret
//!
//! All secret material is zeroized on drop.

mod cookie;
mod mac;
mod secret;

pub use cookie::{COOKIE_SIZE, Cookie, CookieMint, SIDE_SHARED, time_bucket};
pub use mac::{keyed_mac, verify_mac};
pub use secret::{HandshakeKey, SharedSecret};
