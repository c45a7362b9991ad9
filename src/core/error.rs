//! Error types for Tether.

use std::io;

use thiserror::Error;

use crate::transport::ConnectionState;

/// Errors in the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Random number generator failed.
    #[error("random number generator failed: {0}")]
    RandomFailure(#[from] rand::Error),

    /// Public key has the wrong length.
    #[error("invalid public key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Public key is not valid base64.
    #[error("invalid public key encoding: {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),

    /// Peer key is a low-order point; the shared secret would be all zeros.
    #[error("non-contributory key exchange")]
    NonContributory,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,
}

/// Errors in the application payload codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No decoder for this type name.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Payload could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Payload could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Frame and envelope errors. All of them are fatal to the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Body does not fit the u16 length prefix.
    #[error("frame body too large: {0} bytes")]
    TooLarge(usize),

    /// Type name is longer than 255 bytes or not ASCII.
    #[error("invalid type name: {0:?}")]
    InvalidName(String),

    /// Application tried to use a name reserved by the protocol.
    #[error("reserved type name: {0}")]
    ReservedName(String),

    /// Body ended before a field was complete.
    #[error("truncated {0}")]
    Truncated(&'static str),

    /// Response carried an unknown result code.
    #[error("unknown response code: {0}")]
    UnknownCode(u8),

    /// Sealing or opening failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Top-level Tether errors.
#[derive(Debug, Error)]
pub enum RpcError {
    /// TCP connect failed.
    #[error("dial {addr} failed: {source}")]
    Dial {
        /// Remote address.
        addr: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// TCP connect or key exchange did not finish before the dial timeout.
    #[error("dial {addr} timed out")]
    DialTimeout {
        /// Remote address.
        addr: String,
    },

    /// Enqueue attempted on a stopped connection.
    #[error("connector closed")]
    ConnectorClosed,

    /// No reply arrived before the request deadline.
    #[error("request timed out")]
    RequestTimeout,

    /// The connection was torn down while the request was outstanding.
    #[error("client closed")]
    ClientClosed,

    /// Malformed frame or envelope.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// Application codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Key exchange failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Peer misbehaved during key exchange.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Bounded pool has no capacity for a new dial.
    #[error("pool exhausted for {addr}")]
    PoolExhausted {
        /// Remote address.
        addr: String,
    },

    /// Peer answered the request with a failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// Operation not allowed in the current connection state.
    #[error("invalid connection state: {0:?}")]
    InvalidState(ConnectionState),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl RpcError {
    /// Check if the caller may retry on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Dial { .. }
                | RpcError::DialTimeout { .. }
                | RpcError::ConnectorClosed
                | RpcError::ClientClosed
                | RpcError::PoolExhausted { .. }
        )
    }

    /// Check if this error means the connection is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectorClosed
                | RpcError::ClientClosed
                | RpcError::Protocol(_)
                | RpcError::Crypto(_)
                | RpcError::Handshake(_)
                | RpcError::Io(_)
        )
    }
}

/// Result type for Tether operations.
pub type Result<T> = std::result::Result<T, RpcError>;
