//! Frame encoding and decoding for the Tether wire.
//!
//! Wire format:
//!
//! ```text
//! +----------------+------------------------------------------+
//! | Length (BE16)  | Body (Length bytes)                      |
//! +----------------+------------------------------------------+
//!
//! Body (plaintext):
//! +-----------+----------------------+------------------------+
//! | NameLen   | Name (ASCII)         | Payload                |
//! | 1 byte    | NameLen bytes        | rest of body           |
//! +-----------+----------------------+------------------------+
//! ```
//!
//! Once a shared secret is installed the plaintext body is replaced by
//! `nonce | ciphertext | tag` (see [`crate::crypto::aead`]).

use bytes::{Buf, Bytes, BytesMut};

use crate::core::{
    FRAME_ALIGN, FRAME_HEADER_SIZE, FrameError, MAX_FRAME_BODY, MAX_NAME_LEN, SHARED_SECRET_SIZE,
};
use crate::crypto::{FrameSealer, SEAL_OVERHEAD};

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Type discriminator.
    pub name: String,
    /// Payload following the name.
    pub payload: Bytes,
}

/// Length-prefixed frame codec, optionally sealing every body.
#[derive(Debug, Default)]
pub struct FrameCodec {
    sealer: Option<FrameSealer>,
}

fn round_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Check that `name` fits the one-byte length and is ASCII.
pub(crate) fn validate_name(name: &str) -> Result<(), FrameError> {
    if name.len() > MAX_NAME_LEN || !name.is_ascii() {
        return Err(FrameError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl FrameCodec {
    /// Create a plaintext codec.
    pub fn new() -> Self {
        Self { sealer: None }
    }

    /// Create a codec that seals every body.
    pub fn sealed(sealer: FrameSealer) -> Self {
        Self {
            sealer: Some(sealer),
        }
    }

    /// Whether bodies are sealed.
    pub fn is_sealed(&self) -> bool {
        self.sealer.is_some()
    }

    /// Encode one frame.
    pub fn encode(&self, name: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        validate_name(name)?;

        let plain_len = 1 + name.len() + payload.len();
        let (body_len, align) = match self.sealer {
            Some(_) => (plain_len + SEAL_OVERHEAD, SHARED_SECRET_SIZE),
            None => (plain_len, FRAME_ALIGN),
        };
        if body_len > MAX_FRAME_BODY {
            return Err(FrameError::TooLarge(body_len));
        }

        let mut buf = Vec::with_capacity(round_up(FRAME_HEADER_SIZE + body_len, align));
        buf.extend_from_slice(&(body_len as u16).to_be_bytes());
        if self.sealer.is_some() {
            buf.resize(FRAME_HEADER_SIZE + crate::core::AEAD_NONCE_SIZE, 0);
        }
        buf.push(name.len() as u8);
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(payload);

        if let Some(sealer) = &self.sealer {
            sealer.seal_in_place(&mut buf, FRAME_HEADER_SIZE)?;
        }
        debug_assert_eq!(buf.len(), FRAME_HEADER_SIZE + body_len);
        Ok(buf)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a whole frame; nothing
    /// is consumed in that case.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let body_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < FRAME_HEADER_SIZE + body_len {
            buf.reserve(FRAME_HEADER_SIZE + body_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let body = buf.split_to(body_len).freeze();
        let body = match &self.sealer {
            Some(sealer) => Bytes::from(sealer.open(&body)?),
            None => body,
        };

        split_body(body).map(Some)
    }
}

fn split_body(body: Bytes) -> Result<Frame, FrameError> {
    let Some(&name_len) = body.first() else {
        return Err(FrameError::Truncated("name length"));
    };
    let name_end = 1 + name_len as usize;
    if body.len() < name_end {
        return Err(FrameError::Truncated("name"));
    }

    let name = std::str::from_utf8(&body[1..name_end])
        .ok()
        .filter(|name| name.is_ascii())
        .ok_or_else(|| FrameError::InvalidName(String::from_utf8_lossy(&body[1..name_end]).into()))?
        .to_string();

    Ok(Frame {
        name,
        payload: body.slice(name_end..),
    })
}
