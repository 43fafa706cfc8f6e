//! Cryptographic primitives used by the client core.
//!
//! This module provides:
//! - The station's X25519 public key type
//! - Secure random number generation for correlation ids
//!
//! The station handshake itself lives in the raw-flow layer.

mod keys;
mod random;

pub use keys::PublicKey;
pub use random::SecureRandom;

/// Size of X25519 public keys in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;
