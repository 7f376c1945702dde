//! Rendezvous cookies.
//!
//! Wire layout (41 bytes):
//!
//! ```text
//! +------------------+--------+--------------------------+
//! | Session nonce    | Side   | MAC                      |
//! | 8 bytes          | 1 byte | 32 bytes (BLAKE2s-256)   |
//! +------------------+--------+--------------------------+
//! ```
//!
//! `MAC = BLAKE2s(server_secret; nonce || side || LE64(time_bucket))` with
//! `time_bucket = unix_secs / 300`. A cookie verifies in its own bucket and the
//! one after it.

use rand::{RngCore, rngs::OsRng};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::mac::{keyed_mac, verify_mac};
use crate::core::{
    COOKIE_NONCE_SIZE, COOKIE_RESOLUTION, CryptoError, MAC_SIZE, SERVER_SECRET_SIZE,
};

/// Side marker of a cookie that is shared by both peers.
pub const SIDE_SHARED: u8 = 0xFF;

/// Encoded cookie size.
pub const COOKIE_SIZE: usize = COOKIE_NONCE_SIZE + 1 + MAC_SIZE;

/// A rendezvous cookie minted by a mediator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Cookie {
    nonce: [u8; COOKIE_NONCE_SIZE],
    side: u8,
    mac: [u8; MAC_SIZE],
}

impl Cookie {
    /// Session nonce shared by both cookies of a pair.
    pub fn nonce(&self) -> &[u8; COOKIE_NONCE_SIZE] {
        &self.nonce
    }

    /// 0 or 1 for a cookie pair, [`SIDE_SHARED`] for a single cookie.
    pub fn side(&self) -> u8 {
        self.side
    }

    /// Serialize to the 41-byte wire form.
    pub fn to_bytes(&self) -> [u8; COOKIE_SIZE] {
        let mut buf = [0u8; COOKIE_SIZE];
        buf[..COOKIE_NONCE_SIZE].copy_from_slice(&self.nonce);
        buf[COOKIE_NONCE_SIZE] = self.side;
        buf[COOKIE_NONCE_SIZE + 1..].copy_from_slice(&self.mac);
        buf
    }

    /// Parse the wire form. Does not verify the MAC.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != COOKIE_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: COOKIE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut nonce = [0u8; COOKIE_NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..COOKIE_NONCE_SIZE]);
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&bytes[COOKIE_NONCE_SIZE + 1..]);
        Ok(Self {
            nonce,
            side: bytes[COOKIE_NONCE_SIZE],
            mac,
        })
    }
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cookie")
            .field("nonce", &self.nonce)
            .field("side", &self.side)
            .finish_non_exhaustive()
    }
}

/// Time bucket a unix timestamp falls in.
pub fn time_bucket(unix_secs: u64) -> u64 {
    unix_secs / COOKIE_RESOLUTION.as_secs()
}

/// Mints and verifies cookies with a per-mediator secret.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CookieMint {
    secret: [u8; SERVER_SECRET_SIZE],
}

impl CookieMint {
    /// Create a mint with a fresh random secret.
    pub fn generate() -> Self {
        let mut secret = [0u8; SERVER_SECRET_SIZE];
        OsRng.fill_bytes(&mut secret);
        Self { secret }
    }

    /// Create a mint from existing secret bytes.
    pub fn from_secret(secret: [u8; SERVER_SECRET_SIZE]) -> Self {
        Self { secret }
    }

    /// Mint a single cookie, presented by both peers.
    pub fn mint(&self, unix_secs: u64) -> Result<Cookie, CryptoError> {
        self.mint_side(Self::fresh_nonce(), SIDE_SHARED, unix_secs)
    }

    /// Mint a cookie pair, one per peer, for the same session.
    pub fn mint_pair(&self, unix_secs: u64) -> Result<(Cookie, Cookie), CryptoError> {
        let nonce = Self::fresh_nonce();
        Ok((
            self.mint_side(nonce, 0, unix_secs)?,
            self.mint_side(nonce, 1, unix_secs)?,
        ))
    }

    /// Check a cookie's MAC against the current and previous time bucket.
    pub fn verify(&self, cookie: &Cookie, unix_secs: u64) -> bool {
        let bucket = time_bucket(unix_secs);
        [bucket, bucket.wrapping_sub(1)].iter().any(|b| {
            verify_mac(
                &self.secret,
                &[&cookie.nonce, &[cookie.side], &b.to_le_bytes()],
                &cookie.mac,
            )
        })
    }

    fn mint_side(
        &self,
        nonce: [u8; COOKIE_NONCE_SIZE],
        side: u8,
        unix_secs: u64,
    ) -> Result<Cookie, CryptoError> {
        let bucket = time_bucket(unix_secs).to_le_bytes();
        let mac = keyed_mac(&self.secret, &[&nonce, &[side], &bucket])?;
        Ok(Cookie { nonce, side, mac })
    }

    fn fresh_nonce() -> [u8; COOKIE_NONCE_SIZE] {
        let mut nonce = [0u8; COOKIE_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }
}

impl std::fmt::Debug for CookieMint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CookieMint(..)")
    }
}
