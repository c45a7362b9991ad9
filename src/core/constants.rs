//! Protocol constants for the Tether wire format and pipeline.
//!
//! Wire-level values are fixed by the protocol and MUST NOT be changed
//! without breaking interoperability with existing peers.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Shared secret size (also the AES-256-GCM key size).
pub const SHARED_SECRET_SIZE: usize = 32;

/// AES-GCM nonce size.
pub const AEAD_NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

// =============================================================================
// FRAME LAYOUT
// =============================================================================

/// Length prefix size (u16 big-endian).
pub const FRAME_HEADER_SIZE: usize = 2;

/// Largest body a frame can carry.
pub const MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Longest type name (its length is a single byte).
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Plaintext buffers are rounded up to this alignment.
pub const FRAME_ALIGN: usize = 4;

// =============================================================================
// RESERVED MESSAGE NAMES
// =============================================================================

/// Key exchange message (sent unencrypted).
pub const NAME_PUBKEY: &str = "PubkeyMsg";

/// Keepalive probe.
pub const NAME_PING: &str = "PingMsg";

/// Keepalive answer (carries the probe value plus one).
pub const NAME_PONG: &str = "PongMsg";

/// Request envelope.
pub const NAME_REQUEST: &str = "RequestMsg";

/// Response envelope.
pub const NAME_RESPONSE: &str = "ResponseMsg";

/// All names the application codec may not use.
pub const RESERVED_NAMES: [&str; 5] = [NAME_PUBKEY, NAME_PING, NAME_PONG, NAME_REQUEST, NAME_RESPONSE];

// =============================================================================
// PIPELINE
// =============================================================================

/// Consecutive unanswered keepalive probes before the connection is torn down.
pub const MAX_MISSED_PINGS: u32 = 3;

/// A request with less than this share (percent) of its timeout left is not sent.
pub const LATE_SEND_THRESHOLD_PERCENT: u32 = 20;

/// Default outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Default capacity of the read -> dispatch hand-off.
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// Default read chunk size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Default connect (and handshake) deadline.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// POOL
// =============================================================================

/// Default idle connections kept per remote address.
pub const DEFAULT_MAX_IDLE_PER_ADDRESS: usize = 8;

/// Default idle connections kept across all addresses.
pub const DEFAULT_MAX_IDLE_GLOBAL: usize = 256;

/// Default sweep interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default idle entry lifetime.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

// =============================================================================
// RECONNECT
// =============================================================================

/// First reconnect delay.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Reconnect delay ceiling.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Backoff multiplier.
pub const RECONNECT_BACKOFF: u32 = 2;
