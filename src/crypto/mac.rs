//! Keyed BLAKE2s-256 MAC used for cookies and handshake tags.

use blake2::Blake2sMac256;
use blake2::digest::Mac;

use crate::core::{CryptoError, MAC_SIZE};

/// Compute `BLAKE2s-256(key; parts[0] || parts[1] || ...)`.
pub fn keyed_mac(key: &[u8], parts: &[&[u8]]) -> Result<[u8; MAC_SIZE], CryptoError> {
    let mut mac =
        <Blake2sMac256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    for part in parts {
        Mac::update(&mut mac, part);
    }
    let mut out = [0u8; MAC_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Verify a tag in constant time.
pub fn verify_mac(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    let Ok(mut mac) = <Blake2sMac256 as Mac>::new_from_slice(key) else {
        return false;
    };
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.verify_slice(tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_deterministic() {
        let key = [7u8; 32];
        let a = keyed_mac(&key, &[b"hello", b"world"]).unwrap();
        let b = keyed_mac(&key, &[b"helloworld"]).unwrap();
        assert_eq!(a, b);
        assert!(verify_mac(&key, &[b"hello", b"world"], &a));
    }

    #[test]
    fn test_mac_depends_on_key() {
        let a = keyed_mac(&[1u8; 32], &[b"data"]).unwrap();
        let b = keyed_mac(&[2u8; 32], &[b"data"]).unwrap();
        assert_ne!(a, b);
        assert!(!verify_mac(&[2u8; 32], &[b"data"], &a));
    }

    #[test]
    fn test_mac_rejects_oversized_key() {
        assert_eq!(
            keyed_mac(&[0u8; 33], &[b"x"]),
            Err(CryptoError::InvalidKeyLength)
        );
        assert!(!verify_mac(&[0u8; 33], &[b"x"], &[0u8; 32]));
    }

    #[test]
    fn test_mac_rejects_truncated_tag() {
        let key = [3u8; 32];
        let tag = keyed_mac(&key, &[b"payload"]).unwrap();
        assert!(!verify_mac(&key, &[b"payload"], &tag[..16]));
    }
}
