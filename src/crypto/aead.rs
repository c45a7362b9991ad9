//! AES-256-GCM frame sealing
//!
//! A sealed frame body is laid out as:
//!
//! ```text
//! [ nonce (12) | ciphertext (len of plaintext) | tag (16) ]
//! ```
//!
//! The key is the connection's ECDH shared secret. The nonce always travels
//! in front of the ciphertext, so the opening side never needs to know how the
//! sender picked it.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadInPlace, KeyInit},
};
use rand::{RngCore, rngs::OsRng};

use super::keys::SharedSecret;
use crate::core::{AEAD_NONCE_SIZE, AEAD_TAG_SIZE, CryptoError};

/// Bytes added to a body by sealing.
pub const SEAL_OVERHEAD: usize = AEAD_NONCE_SIZE + AEAD_TAG_SIZE;

/// How the sender chooses the per-frame nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonceMode {
    /// A fresh random 96-bit nonce for every frame.
    #[default]
    Random,

    /// The first 12 bytes of the shared secret, reused for every frame.
    ///
    /// # Security
    /// GCM loses confidentiality and integrity when a nonce repeats under
    /// one key. Only for peers that cannot open randomly-nonced frames.
    SecretDerived,
}

/// Seals and opens frame bodies for one connection.
pub struct FrameSealer {
    cipher: Aes256Gcm,
    mode: NonceMode,
    fixed_nonce: [u8; AEAD_NONCE_SIZE],
}

impl FrameSealer {
    /// Create a sealer keyed by `secret`.
    pub fn new(secret: &SharedSecret, mode: NonceMode) -> Self {
        let key = secret.as_bytes();
        let mut fixed_nonce = [0u8; AEAD_NONCE_SIZE];
        fixed_nonce.copy_from_slice(&key[..AEAD_NONCE_SIZE]);
        Self {
            cipher: Aes256Gcm::new(key.into()),
            mode,
            fixed_nonce,
        }
    }

    /// Nonce mode in use.
    pub fn mode(&self) -> NonceMode {
        self.mode
    }

    fn next_nonce(&self) -> [u8; AEAD_NONCE_SIZE] {
        match self.mode {
            NonceMode::Random => {
                let mut nonce = [0u8; AEAD_NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce);
                nonce
            }
            NonceMode::SecretDerived => self.fixed_nonce,
        }
    }

    /// Seal `buf[start..]` in place.
    ///
    /// `buf[start..start + 12]` is reserved for the nonce and overwritten;
    /// the plaintext follows it. The tag is appended.
    pub fn seal_in_place(&self, buf: &mut Vec<u8>, start: usize) -> Result<(), CryptoError> {
        if buf.len() < start + AEAD_NONCE_SIZE {
            return Err(CryptoError::EncryptionFailed);
        }

        let nonce = self.next_nonce();
        buf[start..start + AEAD_NONCE_SIZE].copy_from_slice(&nonce);

        let tag = self
            .cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                b"",
                &mut buf[start + AEAD_NONCE_SIZE..],
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;
        buf.extend_from_slice(&tag);
        Ok(())
    }

    /// Seal `plaintext` into a new buffer.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buf = Vec::with_capacity(plaintext.len() + SEAL_OVERHEAD);
        buf.extend_from_slice(&[0u8; AEAD_NONCE_SIZE]);
        buf.extend_from_slice(plaintext);
        self.seal_in_place(&mut buf, 0)?;
        Ok(buf)
    }

    /// Open a sealed body, verifying its tag.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::DecryptionFailed);
        }

        let (nonce, ciphertext) = sealed.split_at(AEAD_NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for FrameSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSealer")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
