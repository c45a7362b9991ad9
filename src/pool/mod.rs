//! Tether - Connection Pool
//!
//! - [`IdlePool`]: per-address cache of ready connections with idle caps,
//!   an optional bound on open connections, and expiry
//! - [`SweepScheduler`]: one timer task per sweep interval, shared by every
//!   pool using that interval

mod config;
mod idle;
mod sweep;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use idle::IdlePool;
pub use sweep::{Sweep, SweepHandle, SweepScheduler};
