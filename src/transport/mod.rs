//! Tether - Transport Layer
//!
//! Everything between an application value and the TCP socket:
//!
//! - **Framing**: [`FrameCodec`], u16 length-prefixed frames, optionally sealed
//! - **Envelopes**: [`WireMessage`] requests, responses, pings and key exchange
//! - **Correlation**: [`ReplyFuture`] and [`PendingRegistry`]
//! - **Connections**: [`Connection`] with its send, read and dispatch tasks
//! - **Accepting**: [`Listener`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Pool / Reconnector                 │
//! ├─────────────────────────────────────────┤
//! │      Connection + pipeline              │  ← This module
//! │   envelopes, futures, keepalive         │
//! ├─────────────────────────────────────────┤
//! │      Frame codec (+ AES-GCM)            │
//! ├─────────────────────────────────────────┤
//! │              TCP                        │
//! └─────────────────────────────────────────┘
//! ```

mod config;
mod connection;
mod frame;
mod future;
mod listener;
mod message;
mod pipeline;

pub use config::{ConnectionConfig, ConnectionConfigBuilder};
pub use connection::{Connection, ConnectionInfo, ConnectionState, Handler, Incoming, Responder};
pub use frame::{Frame, FrameCodec};
pub use future::{PendingRegistry, ReplyFuture};
pub use listener::Listener;
pub use message::{Reply, RequestHeader, ResponseCode, WireMessage, unix_millis};
