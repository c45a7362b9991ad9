//! X25519 key exchange
//!
//! Each connection generates an ephemeral keypair, swaps public keys in a
//! `PubkeyMsg`, and derives a 32-byte shared secret that keys the frame AEAD.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::{CryptoRng, RngCore, rngs::OsRng};
use x25519_dalek::{StaticSecret, X25519_BASEPOINT_BYTES, x25519};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::{CryptoError, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE, SHARED_SECRET_SIZE};

/// An X25519 private key (clamped). Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; PRIVATE_KEY_SIZE]);

impl PrivateKey {
    /// Create from raw bytes. The bytes are clamped.
    pub fn from_bytes(mut bytes: [u8; PRIVATE_KEY_SIZE]) -> Self {
        clamp(&mut bytes);
        Self(bytes)
    }

    /// Get the clamped key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.0
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519(self.0, X25519_BASEPOINT_BYTES))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

/// An X25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Standard base64 encoding, as carried by `PubkeyMsg`.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Parse the standard base64 encoding.
    pub fn from_base64(encoded: &[u8]) -> Result<Self, CryptoError> {
        let raw = STANDARD.decode(encoded)?;
        unmarshal(&raw)
    }
}

/// A 32-byte ECDH shared secret. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    /// Wrap existing secret bytes (tests and pre-shared setups).
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw secret.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Clamp a scalar per RFC 7748: clear the low three bits, clear the top
/// bit, set the second-highest bit.
fn clamp(bytes: &mut [u8; PRIVATE_KEY_SIZE]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}

/// Generate a new keypair from `rng`.
pub fn generate_key<R: RngCore + CryptoRng>(
    rng: &mut R,
) -> Result<(PrivateKey, PublicKey), CryptoError> {
    let mut bytes = [0u8; PRIVATE_KEY_SIZE];
    rng.try_fill_bytes(&mut bytes)?;
    let private = PrivateKey::from_bytes(bytes);
    bytes.zeroize();
    let public = private.public_key();
    Ok((private, public))
}

/// Generate a new keypair from the operating system RNG.
pub fn generate_ephemeral() -> Result<(PrivateKey, PublicKey), CryptoError> {
    generate_key(&mut OsRng)
}

/// Serialize a public key.
pub fn marshal(public: &PublicKey) -> [u8; PUBLIC_KEY_SIZE] {
    public.0
}

/// Parse a public key; fails unless exactly 32 bytes are given.
pub fn unmarshal(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    let raw: [u8; PUBLIC_KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
    Ok(PublicKey(raw))
}

/// Compute DH(private, peer_public).
///
/// Rejects low-order peer keys, which would yield an all-zero secret.
pub fn generate_shared_secret(
    private: &PrivateKey,
    peer: &PublicKey,
) -> Result<SharedSecret, CryptoError> {
    let secret = StaticSecret::from(private.0);
    let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer.0));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    Ok(SharedSecret(*shared.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_from_hex(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_keypair_generation() {
        let (priv1, pub1) = generate_ephemeral().unwrap();
        let (priv2, pub2) = generate_ephemeral().unwrap();

        // Keys should be different
        assert_ne!(pub1, pub2);
        assert_ne!(priv1.as_bytes(), priv2.as_bytes());

        // Generated scalars are clamped
        assert_eq!(priv1.as_bytes()[0] & 7, 0);
        assert_eq!(priv1.as_bytes()[31] & 0xC0, 0x40);
    }

    #[test]
    fn test_shared_secret_agreement() {
        let (priv_a, pub_a) = generate_ephemeral().unwrap();
        let (priv_b, pub_b) = generate_ephemeral().unwrap();

        let ab = generate_shared_secret(&priv_a, &pub_b).unwrap();
        let ba = generate_shared_secret(&priv_b, &pub_a).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_rfc7748_vector() {
        let alice = PrivateKey::from_bytes(key_from_hex(
            "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a",
        ));
        let bob = PrivateKey::from_bytes(key_from_hex(
            "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb",
        ));

        assert_eq!(
            hex::encode(alice.public_key().as_bytes()),
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
        );
        assert_eq!(
            hex::encode(bob.public_key().as_bytes()),
            "de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f"
        );

        let shared = generate_shared_secret(&alice, &bob.public_key()).unwrap();
        assert_eq!(
            hex::encode(shared.as_bytes()),
            "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742"
        );
    }

    #[test]
    fn test_unmarshal_rejects_wrong_length() {
        assert!(matches!(
            unmarshal(&[0u8; 31]),
            Err(CryptoError::InvalidKeyLength(31))
        ));
        assert!(matches!(
            unmarshal(&[0u8; 33]),
            Err(CryptoError::InvalidKeyLength(33))
        ));

        let (_, public) = generate_ephemeral().unwrap();
        assert_eq!(unmarshal(&marshal(&public)).unwrap(), public);
    }

    #[test]
    fn test_base64_roundtrip() {
        let (_, public) = generate_ephemeral().unwrap();
        let encoded = public.to_base64();
        assert_eq!(encoded.len(), 44);
        assert_eq!(PublicKey::from_base64(encoded.as_bytes()).unwrap(), public);

        assert!(matches!(
            PublicKey::from_base64(b"not base64!"),
            Err(CryptoError::InvalidKeyEncoding(_))
        ));
    }

    #[test]
    fn test_low_order_point_rejected() {
        let (private, _) = generate_ephemeral().unwrap();
        let zero = unmarshal(&[0u8; 32]).unwrap();
        assert!(matches!(
            generate_shared_secret(&private, &zero),
            Err(CryptoError::NonContributory)
        ));
    }

    #[test]
    fn test_failing_rng() {
        struct BrokenRng;

        impl RngCore for BrokenRng {
            fn next_u32(&mut self) -> u32 {
                0
            }
            fn next_u64(&mut self) -> u64 {
                0
            }
            fn fill_bytes(&mut self, _dest: &mut [u8]) {}
            fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
                Err(rand::Error::new(std::io::Error::other("entropy source gone")))
            }
        }
        impl CryptoRng for BrokenRng {}

        assert!(matches!(
            generate_key(&mut BrokenRng),
            Err(CryptoError::RandomFailure(_))
        ));
    }
}
