//! Reply futures and the pending-request registry.
//!
//! A [`ReplyFuture`] is a single-assignment cell keyed by a request's
//! sequence id. Three parties race to fill it: the dispatch task (reply),
//! the deadline timer (timeout), and connection teardown (closed). All of
//! them go through [`ReplyFuture::resolve`], which takes the cell's lock and
//! only lets the first writer through.

use std::pin::pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::core::RpcError;

struct Slot<T> {
    done: bool,
    result: Option<Result<T, RpcError>>,
    timer: Option<JoinHandle<()>>,
}

struct Shared<T> {
    seq: u32,
    slot: Mutex<Slot<T>>,
    notify: Notify,
    registry: Weak<PendingRegistry<T>>,
}

/// Single-shot result cell for one request.
pub struct ReplyFuture<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for ReplyFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for ReplyFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyFuture")
            .field("seq", &self.inner.seq)
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T: Send + 'static> ReplyFuture<T> {
    fn new(seq: u32, registry: Weak<PendingRegistry<T>>) -> Self {
        Self {
            inner: Arc::new(Shared {
                seq,
                slot: Mutex::new(Slot {
                    done: false,
                    result: None,
                    timer: None,
                }),
                notify: Notify::new(),
                registry,
            }),
        }
    }

    /// Sequence id this future answers.
    pub fn seq(&self) -> u32 {
        self.inner.seq
    }

    /// Whether a result has been stored.
    pub fn is_done(&self) -> bool {
        self.inner.slot.lock().done
    }

    /// Store `result` and wake the waiter.
    ///
    /// Returns `false` (and changes nothing) if the future was already
    /// resolved. Resolution stops the timer and unregisters the future.
    pub fn resolve(&self, result: Result<T, RpcError>) -> bool {
        let timer = {
            let mut slot = self.inner.slot.lock();
            if slot.done {
                return false;
            }
            slot.done = true;
            slot.result = Some(result);
            slot.timer.take()
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        self.detach();
        self.inner.notify.notify_waiters();
        true
    }

    /// Start the deadline timer.
    ///
    /// When it fires before any other resolution, the future resolves with
    /// [`RpcError::RequestTimeout`].
    pub fn arm(&self, timeout: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Detach our own handle so resolve() does not abort this task.
            this.inner.slot.lock().timer.take();
            this.resolve(Err(RpcError::RequestTimeout));
        });

        let mut slot = self.inner.slot.lock();
        if slot.done {
            handle.abort();
        } else if let Some(previous) = slot.timer.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the timer and unregister without resolving.
    pub fn cancel(&self) {
        if let Some(timer) = self.inner.slot.lock().timer.take() {
            timer.abort();
        }
        self.detach();
    }

    fn detach(&self) {
        if let Some(registry) = self.inner.registry.upgrade() {
            registry
                .map
                .remove_if(&self.inner.seq, |_, entry| Arc::ptr_eq(&entry.inner, &self.inner));
        }
    }

    /// Wait for the result.
    pub async fn wait(self) -> Result<T, RpcError> {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();

            {
                let mut slot = self.inner.slot.lock();
                if slot.done {
                    // Only one caller owns the waiting side.
                    return slot.result.take().unwrap_or(Err(RpcError::ClientClosed));
                }
            }

            notified.await;
        }
    }
}

/// Outstanding requests of one connection, keyed by sequence id.
pub struct PendingRegistry<T> {
    map: DashMap<u32, ReplyFuture<T>>,
}

impl<T: Send + 'static> PendingRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: DashMap::new(),
        })
    }

    /// Allocate the next free sequence id from `counter` and register a
    /// future for it.
    ///
    /// The counter wraps; 0 and ids that are still outstanding are skipped.
    pub fn register(self: &Arc<Self>, counter: &AtomicU32) -> ReplyFuture<T> {
        loop {
            let seq = next_sequence(counter);
            if let Entry::Vacant(vacant) = self.map.entry(seq) {
                let future = ReplyFuture::new(seq, Arc::downgrade(self));
                vacant.insert(future.clone());
                return future;
            }
        }
    }

    /// Remove and return the future for `seq`.
    pub fn take(&self, seq: u32) -> Option<ReplyFuture<T>> {
        self.map.remove(&seq).map(|(_, future)| future)
    }

    /// Whether `seq` is outstanding.
    pub fn contains(&self, seq: u32) -> bool {
        self.map.contains_key(&seq)
    }

    /// Remove and return every outstanding future.
    pub fn drain(&self) -> Vec<ReplyFuture<T>> {
        let keys: Vec<u32> = self.map.iter().map(|entry| *entry.key()).collect();
        keys.into_iter().filter_map(|seq| self.take(seq)).collect()
    }

    /// Resolve every outstanding future with an error from `make_error`.
    ///
    /// Returns how many futures this call resolved.
    pub fn fail_all(&self, make_error: impl Fn() -> RpcError) -> usize {
        self.drain()
            .into_iter()
            .filter(|future| future.resolve(Err(make_error())))
            .count()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn next_sequence(counter: &AtomicU32) -> u32 {
    loop {
        let seq = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if seq != 0 {
            return seq;
        }
    }
}
