//! # Tether
//!
//! RPC transport core: duplex binary connections with request/response
//! correlation, idle connection pooling, and reconnection.
//!
//! - **Correlation**: concurrent callers share one connection; each request
//!   suspends its caller until the matching reply, a timeout, or teardown
//! - **Pipeline**: send, read and dispatch tasks per connection, joined by
//!   bounded channels
//! - **Security**: optional X25519 key exchange and AES-256-GCM sealing of
//!   every frame
//! - **Pooling**: per-address idle cache with idle caps, an optional bound
//!   on open connections, and shared eviction sweeps
//! - **Supervision**: reconnect loop with exponential backoff
//!
//! ## Feature Flags
//!
//! - `pool` (default): [`pool::IdlePool`] and [`pool::SweepScheduler`]
//! - `client` (default): [`client::Reconnector`]
//!
//! ## Modules
//!
//! - [`core`]: traits, constants, and error types
//! - [`crypto`]: key exchange and frame sealing
//! - [`transport`]: framing, envelopes, futures, connections, listener
//! - [`pool`]: idle pool (requires `pool` feature)
//! - [`client`]: reconnector (requires `client` feature)
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tether_rpc::prelude::*;
//!
//! # async fn run() -> tether_rpc::core::Result<()> {
//! let config = ConnectionConfigBuilder::new().encrypt(true).build()?;
//! let connection = Connection::connect(
//!     "127.0.0.1:7000",
//!     Arc::new(RawCodec),
//!     Arc::new(()),
//!     config,
//! )
//! .await?;
//!
//! let reply = connection
//!     .request_message(&Payload::new("Echo", &b"hello"[..]), Duration::from_secs(1))
//!     .await?;
//! assert_eq!(reply.name, "Echo");
//!
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Always included
pub mod core;
pub mod crypto;
pub mod transport;

// Idle pool (feature-gated)
#[cfg(feature = "pool")]
#[cfg_attr(docsrs, doc(cfg(feature = "pool")))]
pub mod pool;

// Reconnector (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core traits and types
    pub use crate::core::{
        Balancer, Codec, CodecError, CryptoError, FrameError, Payload, RawCodec, RpcError,
    };

    // Transport types
    pub use crate::transport::{
        Connection, ConnectionConfig, ConnectionConfigBuilder, ConnectionInfo, ConnectionState,
        Handler, Incoming, Listener, Responder,
    };

    pub use crate::crypto::NonceMode;

    #[cfg(feature = "pool")]
    pub use crate::pool::{IdlePool, PoolConfig, PoolConfigBuilder, SweepScheduler};

    #[cfg(feature = "client")]
    pub use crate::client::{Backoff, ReconnectConfig, Reconnector};
}

// Re-export commonly used items at crate root
pub use core::{Codec, Payload, RawCodec, RpcError};
pub use transport::{Connection, ConnectionConfig, Handler, Listener};
