//! Tether - Client Supervision
//!
//! Reconnect loop with exponential backoff for connections that live
//! outside the idle pool.

mod backoff;
mod reconnect;

pub use backoff::{Backoff, ReconnectConfig};
pub use reconnect::Reconnector;
