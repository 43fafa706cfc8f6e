//! Station public key.
//!
//! The station identifies itself with a long-term X25519 key. The client
//! only ever holds the public half; both flows of a session are tagged
//! against the same key.

use x25519_dalek::PublicKey as DalekPublic;

use crate::crypto::PUBLIC_KEY_SIZE;

/// An X25519 public key.
///
/// Safe to share publicly. Immutable once fetched from the asset store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(DalekPublic);

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(DalekPublic::from(bytes))
    }

    /// Get the raw bytes of this public key.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }

    /// Check for the all-zero key, which no station uses.
    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }
}
