//! Keyed one-shot timers backed by a min-heap.
//!
//! A single dispatch task sleeps until the earliest deadline, pops every
//! due entry and runs its callback. Each entry carries a `claimed` flag; the
//! dispatcher and [`TimerService::disarm`] race on it with a
//! compare-and-swap, so a callback runs at most once and never after a
//! successful disarm.
//!
//! Disarmed entries stay in the heap until they surface (or until the heap
//! grows well past the number of live timers, at which point it is rebuilt).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Callback run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Heap slack tolerated before stale entries are purged.
const COMPACT_SLACK: usize = 64;

struct TimerEntry {
    key: String,
    deadline: Instant,
    claimed: AtomicBool,
    callback: Mutex<Option<TimerCallback>>,
}

impl TimerEntry {
    /// Claim the entry. Only the first caller wins.
    fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Arc<TimerEntry>>,
    by_key: HashMap<String, u64>,
}

impl TimerState {
    fn remove(&mut self, id: u64) -> Option<Arc<TimerEntry>> {
        let entry = self.entries.remove(&id)?;
        if self.by_key.get(&entry.key) == Some(&id) {
            self.by_key.remove(&entry.key);
        }
        Some(entry)
    }

    fn compact(&mut self) {
        if self.heap.len() > self.entries.len() * 2 + COMPACT_SLACK {
            self.heap = self
                .entries
                .iter()
                .map(|(id, entry)| Reverse((entry.deadline, *id)))
                .collect();
        }
    }
}

struct TimerInner {
    state: Mutex<TimerState>,
    notify: Notify,
    next_id: AtomicU64,
    fired: AtomicU64,
}

/// Keyed timer service. Cloning shares the same heap.
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<TimerInner>,
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("pending", &self.pending())
            .field("fired", &self.fired_count())
            .finish()
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService {
    /// Create an idle timer service. Call [`spawn`](Self::spawn) to start
    /// dispatching.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerInner {
                state: Mutex::new(TimerState::default()),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
                fired: AtomicU64::new(0),
            }),
        }
    }

    /// Arm a timer `delay` from now. An existing timer with the same key is
    /// replaced and will not fire.
    pub fn arm<F>(&self, key: impl Into<String>, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.arm_at(key, Instant::now() + delay, callback);
    }

    /// Arm a timer at an absolute deadline.
    pub fn arm_at<F>(&self, key: impl Into<String>, deadline: Instant, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let key = key.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(TimerEntry {
            key: key.clone(),
            deadline,
            claimed: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        });

        {
            let mut state = self.inner.state.lock();
            if let Some(old_id) = state.by_key.insert(key.clone(), id) {
                if let Some(old) = state.entries.remove(&old_id) {
                    old.claim();
                }
            }
            state.entries.insert(id, entry);
            state.heap.push(Reverse((deadline, id)));
            state.compact();
        }

        tracing::trace!(timer = %key, "Timer armed");
        self.inner.notify.notify_one();
    }

    /// Disarm the timer for `key`. Returns `true` when a pending timer was
    /// cancelled, `false` if none existed or it already fired.
    pub fn disarm(&self, key: &str) -> bool {
        let entry = {
            let mut state = self.inner.state.lock();
            let Some(id) = state.by_key.get(key).copied() else {
                return false;
            };
            state.remove(id)
        };

        match entry {
            Some(entry) => {
                let cancelled = entry.claim();
                if cancelled {
                    entry.callback.lock().take();
                    tracing::trace!(timer = %key, "Timer disarmed");
                }
                cancelled
            }
            None => false,
        }
    }

    /// Whether a timer is pending for `key`.
    #[must_use]
    pub fn is_armed(&self, key: &str) -> bool {
        self.inner.state.lock().by_key.contains_key(key)
    }

    /// Deadline of the pending timer for `key`.
    #[must_use]
    pub fn deadline(&self, key: &str) -> Option<Instant> {
        let state = self.inner.state.lock();
        let id = state.by_key.get(key)?;
        state.entries.get(id).map(|e| e.deadline)
    }

    /// Number of pending timers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Total callbacks run since creation.
    #[must_use]
    pub fn fired_count(&self) -> u64 {
        self.inner.fired.load(Ordering::Relaxed)
    }

    /// Run every timer whose deadline is at or before `now`. Returns the
    /// number of callbacks run.
    pub fn fire_due(&self, now: Instant) -> usize {
        let due: Vec<Arc<TimerEntry>> = {
            let mut state = self.inner.state.lock();
            let mut due = Vec::new();
            while let Some(Reverse((deadline, id))) = state.heap.peek().copied() {
                if deadline > now {
                    break;
                }
                state.heap.pop();
                // Stale ids (disarmed or replaced) are simply skipped
                if let Some(entry) = state.remove(id) {
                    due.push(entry);
                }
            }
            due
        };

        let mut fired = 0;
        for entry in due {
            if !entry.claim() {
                continue;
            }
            let callback = entry.callback.lock().take();
            if let Some(callback) = callback {
                tracing::debug!(timer = %entry.key, "Timer fired");
                callback();
                fired += 1;
            }
        }

        self.inner.fired.fetch_add(fired as u64, Ordering::Relaxed);
        fired
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .state
            .lock()
            .heap
            .peek()
            .map(|Reverse((deadline, _))| *deadline)
    }

    /// Spawn the dispatch loop. It exits when `shutdown` is cancelled.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let timers = self.clone();
        tokio::spawn(async move {
            tracing::debug!("Timer dispatcher started");
            loop {
                timers.fire_due(Instant::now());

                let next = timers.next_deadline();
                let notified = timers.inner.notify.notified();

                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = notified => {}
                    () = sleep_until_opt(next) => {}
                }
            }
            tracing::debug!("Timer dispatcher stopped");
        })
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
