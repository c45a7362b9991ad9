//! Idle connection pool.
//!
//! Connections are checked out with [`IdlePool::get`] and handed back with
//! [`IdlePool::put`]. Idle connections are kept per remote address, newest
//! last, and reused newest first. The shared sweep closes connections that
//! have been idle longer than `idle_timeout`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::config::PoolConfig;
use super::sweep::{Sweep, SweepHandle, SweepScheduler};
use crate::core::{Codec, Result, RpcError};
use crate::transport::{Connection, Handler};

struct IdleEntry<C: Codec> {
    connection: Connection<C>,
    expires_at: Instant,
}

struct PoolInner<C: Codec> {
    config: PoolConfig,
    codec: Arc<C>,
    handler: Arc<dyn Handler<C::Item>>,
    idle: Mutex<HashMap<String, VecDeque<IdleEntry<C>>>>,
    idle_count: AtomicUsize,
    opened: AtomicUsize,
    opened_per_address: DashMap<String, usize>,
    closed: AtomicBool,
}

/// Cache of ready connections keyed by remote address.
pub struct IdlePool<C: Codec> {
    inner: Arc<PoolInner<C>>,
    sweep: Mutex<Option<SweepHandle>>,
}

impl<C: Codec> IdlePool<C> {
    /// Create a pool swept by the process-wide scheduler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: PoolConfig,
        codec: Arc<C>,
        handler: Arc<dyn Handler<C::Item>>,
    ) -> Result<Self> {
        Self::with_scheduler(config, codec, handler, &SweepScheduler::global())
    }

    /// Create a pool swept by `scheduler`.
    pub fn with_scheduler(
        config: PoolConfig,
        codec: Arc<C>,
        handler: Arc<dyn Handler<C::Item>>,
        scheduler: &Arc<SweepScheduler>,
    ) -> Result<Self> {
        config.validate()?;
        let interval = config.sweep_interval;
        let inner = Arc::new(PoolInner {
            config,
            codec,
            handler,
            idle: Mutex::new(HashMap::new()),
            idle_count: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            opened_per_address: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        let target: Weak<PoolInner<C>> = Arc::downgrade(&inner);
        let sweep = scheduler.register(interval, target);
        Ok(Self {
            inner,
            sweep: Mutex::new(Some(sweep)),
        })
    }

    /// Check out a connection to `addr`, reusing an idle one if possible.
    pub async fn get(&self, addr: &str) -> Result<Connection<C>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectorClosed);
        }
        if let Some(connection) = self.inner.pop_ready(addr) {
            trace!(addr, "reusing idle connection");
            return Ok(connection);
        }

        self.inner.reserve(addr)?;
        let connection = Connection::new(
            addr,
            Arc::clone(&self.inner.codec),
            Arc::clone(&self.inner.handler),
            self.inner.config.connection.clone(),
        );
        match connection.dial().await {
            Ok(()) => {
                debug!(addr, opened = self.opened(), "dialed pooled connection");
                Ok(connection)
            }
            Err(e) => {
                self.inner.release(addr);
                Err(e)
            }
        }
    }

    /// Hand a connection back.
    ///
    /// The connection is closed instead of kept if it is no longer
    /// connected, if its address already holds `max_idle_per_address` idle
    /// connections, or if the pool holds `max_idle_global`.
    pub fn put(&self, connection: Connection<C>) {
        let addr = connection.address().to_string();
        if !connection.is_connected() || self.inner.closed.load(Ordering::Acquire) {
            self.inner.shed(connection, &addr, "not reusable");
            return;
        }

        let mut idle = self.inner.idle.lock();
        let at_address = idle.get(&addr).map_or(0, VecDeque::len);
        if at_address >= self.inner.config.max_idle_per_address
            || self.inner.idle_count.load(Ordering::Acquire) >= self.inner.config.max_idle_global
        {
            drop(idle);
            self.inner.shed(connection, &addr, "idle cap reached");
            return;
        }

        idle.entry(addr).or_default().push_back(IdleEntry {
            connection,
            expires_at: Instant::now() + self.inner.config.idle_timeout,
        });
        self.inner.idle_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Close a checked-out connection and release its slot.
    pub async fn discard(&self, connection: Connection<C>) {
        connection.close().await;
        self.inner.release(connection.address());
    }

    /// Close idle connections past their expiry, keeping
    /// `min_idle_per_address` per address.
    pub fn tick(&self) {
        self.inner.evict_expired();
    }

    /// Close every idle connection and stop sweeping. Later `get` calls fail
    /// and later `put` calls close the connection.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained = self.inner.drain_all();
        for entry in &drained {
            entry.connection.close().await;
            self.inner.release(entry.connection.address());
        }
        self.sweep.lock().take();
        debug!(closed = drained.len(), "pool shut down");
    }

    /// Connections opened and not yet closed.
    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::Acquire)
    }

    /// Connections to `addr` opened and not yet closed.
    pub fn opened_for(&self, addr: &str) -> usize {
        self.inner
            .opened_per_address
            .get(addr)
            .map_or(0, |count| *count)
    }

    /// Idle connections across all addresses.
    pub fn idle_count(&self) -> usize {
        self.inner.idle_count.load(Ordering::Acquire)
    }

    /// Idle connections to `addr`.
    pub fn idle_count_for(&self, addr: &str) -> usize {
        self.inner.idle.lock().get(addr).map_or(0, VecDeque::len)
    }

    /// Pool settings.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl<C: Codec> PoolInner<C> {
    fn pop_ready(&self, addr: &str) -> Option<Connection<C>> {
        let mut broken = Vec::new();
        let found = {
            let mut idle = self.idle.lock();
            let list = idle.get_mut(addr)?;
            let mut found = None;
            while let Some(entry) = list.pop_back() {
                self.idle_count.fetch_sub(1, Ordering::AcqRel);
                if entry.connection.is_connected() {
                    found = Some(entry.connection);
                    break;
                }
                broken.push(entry.connection);
            }
            if list.is_empty() {
                idle.remove(addr);
            }
            found
        };

        for connection in broken {
            self.shed(connection, addr, "idle connection broken");
        }
        found
    }

    fn reserve(&self, addr: &str) -> Result<()> {
        if let Some(max) = self.config.max_open {
            self.opened
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < max).then_some(n + 1)
                })
                .map_err(|_| RpcError::PoolExhausted { addr: addr.into() })?;
        } else {
            self.opened.fetch_add(1, Ordering::AcqRel);
        }
        *self.opened_per_address.entry(addr.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn release(&self, addr: &str) {
        let _ = self
            .opened
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.opened_per_address
            .remove_if_mut(addr, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            });
    }

    fn shed(&self, connection: Connection<C>, addr: &str, reason: &'static str) {
        trace!(addr, reason, "closing pooled connection");
        connection.stop();
        self.release(addr);
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        let min = self.config.min_idle_per_address;
        let mut evicted: Vec<(String, Connection<C>)> = Vec::new();

        {
            let mut idle = self.idle.lock();
            for (addr, list) in idle.iter_mut() {
                // Broken connections never count toward the floor.
                let (live, dead): (VecDeque<_>, VecDeque<_>) = std::mem::take(list)
                    .into_iter()
                    .partition(|entry| entry.connection.is_connected());
                *list = live;
                evicted.extend(dead.into_iter().map(|e| (addr.clone(), e.connection)));

                // Oldest entries sit at the front.
                while list.len() > min && list.front().is_some_and(|e| e.expires_at <= now) {
                    if let Some(entry) = list.pop_front() {
                        evicted.push((addr.clone(), entry.connection));
                    }
                }
            }
            idle.retain(|_, list| !list.is_empty());
            self.idle_count.fetch_sub(evicted.len(), Ordering::AcqRel);
        }

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicting idle connections");
        }
        for (addr, connection) in evicted {
            self.shed(connection, &addr, "idle timeout");
        }
    }

    fn drain_all(&self) -> Vec<IdleEntry<C>> {
        let mut idle = self.idle.lock();
        let drained: Vec<_> = idle.drain().flat_map(|(_, list)| list).collect();
        self.idle_count.store(0, Ordering::Release);
        drained
    }
}

impl<C: Codec> Sweep for PoolInner<C> {
    fn tick(&self) {
        self.evict_expired();
    }
}

impl<C: Codec> std::fmt::Debug for IdlePool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdlePool")
            .field("opened", &self.opened())
            .field("idle", &self.idle_count())
            .finish_non_exhaustive()
    }
}
