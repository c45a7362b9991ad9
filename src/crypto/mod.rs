//! Tether - Security Layer
//!
//! Implements the cryptographic primitives for Tether:
//! - X25519 ephemeral key exchange
//! - AES-256-GCM frame sealing

pub mod aead;
pub mod keys;

pub use aead::{FrameSealer, NonceMode, SEAL_OVERHEAD};
pub use keys::{
    PrivateKey, PublicKey, SharedSecret, generate_ephemeral, generate_key,
    generate_shared_secret, marshal, unmarshal,
};
