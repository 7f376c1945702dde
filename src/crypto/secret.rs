//! Shared secrets and the P2P handshake key built from them.
//!
//! The secret never leaves this module in a form that outlives the owning
//! value: both types are zeroized on drop.

use rand::{RngCore, rngs::OsRng};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::mac::{keyed_mac, verify_mac};
use crate::core::{COOKIE_NONCE_SIZE, CryptoError, MAC_SIZE, SHARED_SECRET_SIZE};

const HANDSHAKE_LABEL: &[u8] = b"emi p2p handshake v1";

/// A 32-byte secret shared by two P2P peers.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    /// Generate a fresh secret from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SHARED_SECRET_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing secret bytes.
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a secret from a slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SHARED_SECRET_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                expected: SHARED_SECRET_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// Secret bytes.
    ///
    /// # Security
    /// Handle with care - this exposes the secret.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Authenticates P2P handshake messages between the two matched peers.
///
/// Tags bind the shared secret, the rendezvous session, the sender's role and
/// the message header, so a reflected or replayed-across-sessions handshake
/// does not verify.
#[derive(Clone)]
pub struct HandshakeKey {
    secret: SharedSecret,
    session: [u8; COOKIE_NONCE_SIZE],
    role: u8,
}

impl HandshakeKey {
    /// Create a key for the peer with the given `role` (0 or 1) in `session`.
    pub fn new(secret: SharedSecret, session: [u8; COOKIE_NONCE_SIZE], role: u8) -> Self {
        Self {
            secret,
            session,
            role: role & 1,
        }
    }

    /// Tag an outgoing handshake message.
    pub fn sign(&self, flags: u8, isn: u16) -> Result<[u8; MAC_SIZE], CryptoError> {
        let header = Self::header(self.role, flags, isn);
        keyed_mac(
            self.secret.as_bytes(),
            &[HANDSHAKE_LABEL, &self.session, &header],
        )
    }

    /// Verify a handshake message sent by the other peer.
    pub fn verify(&self, flags: u8, isn: u16, tag: &[u8]) -> bool {
        let header = Self::header(self.role ^ 1, flags, isn);
        verify_mac(
            self.secret.as_bytes(),
            &[HANDSHAKE_LABEL, &self.session, &header],
            tag,
        )
    }

    fn header(role: u8, flags: u8, isn: u16) -> [u8; 4] {
        let isn = isn.to_le_bytes();
        [role, flags, isn[0], isn[1]]
    }
}

impl std::fmt::Debug for HandshakeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeKey")
            .field("session", &self.session)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}
