//! Shared periodic sweep.
//!
//! Pools that sweep at the same interval share one timer task. The
//! scheduler only holds weak references to its registrants; when the last
//! registrant of an interval goes away, that interval's task exits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// Periodic maintenance hook.
pub trait Sweep: Send + Sync + 'static {
    /// Run one maintenance pass. Must not block.
    fn tick(&self);
}

struct Group {
    members: Vec<(u64, Weak<dyn Sweep>)>,
    task: JoinHandle<()>,
}

/// Registry of sweep timers keyed by interval.
pub struct SweepScheduler {
    groups: Mutex<HashMap<Duration, Group>>,
    next_id: AtomicU64,
}

static GLOBAL: OnceLock<Arc<SweepScheduler>> = OnceLock::new();

impl SweepScheduler {
    /// Create an independent scheduler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            groups: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// The process-wide scheduler.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(Self::new))
    }

    /// Register `target` to be ticked every `interval`.
    ///
    /// Must be called from within a tokio runtime. The registration lasts
    /// until the returned handle is dropped or `target` is gone.
    pub fn register(self: &Arc<Self>, interval: Duration, target: Weak<dyn Sweep>) -> SweepHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut groups = self.groups.lock();

        // A finished task means the group emptied itself on its last tick.
        if groups.get(&interval).is_some_and(|g| g.task.is_finished()) {
            groups.remove(&interval);
        }

        match groups.get_mut(&interval) {
            Some(group) => group.members.push((id, target)),
            None => {
                debug!(?interval, "starting sweep task");
                let task = tokio::spawn(run(Arc::downgrade(self), interval));
                groups.insert(
                    interval,
                    Group {
                        members: vec![(id, target)],
                        task,
                    },
                );
            }
        }

        SweepHandle {
            scheduler: Arc::downgrade(self),
            interval,
            id,
        }
    }

    fn unregister(&self, interval: Duration, id: u64) {
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(&interval) else {
            return;
        };
        group.members.retain(|(member, _)| *member != id);
        if group.members.is_empty() {
            if let Some(group) = groups.remove(&interval) {
                group.task.abort();
                debug!(?interval, "sweep task stopped, no registrants left");
            }
        }
    }

    /// Live registrations for `interval`.
    pub fn registrants(&self, interval: Duration) -> usize {
        self.groups.lock().get(&interval).map_or(0, |group| {
            group
                .members
                .iter()
                .filter(|(_, target)| target.strong_count() > 0)
                .count()
        })
    }

    /// Number of running sweep tasks.
    pub fn task_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Stop every sweep task and forget every registration.
    pub fn shutdown(&self) {
        let groups: Vec<Group> = self.groups.lock().drain().map(|(_, g)| g).collect();
        for group in &groups {
            group.task.abort();
        }
        debug!(tasks = groups.len(), "sweep scheduler shut down");
    }

    /// Snapshot the live members of `interval`, pruning dead ones.
    ///
    /// Returns `None` once the group is empty, removing it.
    fn members(&self, interval: Duration) -> Option<Vec<Weak<dyn Sweep>>> {
        let mut groups = self.groups.lock();
        let group = groups.get_mut(&interval)?;
        group.members.retain(|(_, target)| target.strong_count() > 0);
        if group.members.is_empty() {
            groups.remove(&interval);
            return None;
        }
        Some(group.members.iter().map(|(_, t)| Weak::clone(t)).collect())
    }
}

async fn run(scheduler: Weak<SweepScheduler>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(scheduler) = scheduler.upgrade() else {
            return;
        };
        let Some(members) = scheduler.members(interval) else {
            debug!(?interval, "sweep task exiting, registrants gone");
            return;
        };
        drop(scheduler);

        trace!(?interval, count = members.len(), "sweep");
        for target in members.iter().filter_map(Weak::upgrade) {
            target.tick();
        }
    }
}

/// Keeps a sweep registration alive. Dropping it unregisters.
#[derive(Debug)]
pub struct SweepHandle {
    scheduler: Weak<SweepScheduler>,
    interval: Duration,
    id: u64,
}

impl SweepHandle {
    /// Interval this registration ticks at.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.unregister(self.interval, self.id);
        }
    }
}

impl std::fmt::Debug for SweepScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepScheduler")
            .field("tasks", &self.task_count())
            .finish()
    }
}
