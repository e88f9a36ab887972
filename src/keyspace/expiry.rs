//! Expiration Scheduler
//!
//! Per-key eviction timers with cancel-on-rewrite semantics.
//!
//! Timers live in a min-heap keyed by deadline. Cancellation is lazy: the
//! `pending` map holds the one live timer version per key, and a popped
//! timer whose version no longer matches is dropped. Rescheduling a key is
//! therefore just replacing its `pending` version.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock::Clock;

use super::table::KeySpace;

/// Stale heap entries tolerated before the heap is rebuilt
const COMPACT_SLACK: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Timer {
    deadline: u64,
    version: u64,
    key: String,
}

#[derive(Debug, Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<Timer>>,
    pending: HashMap<String, u64>,
    shutdown: bool,
}

/// Deferred eviction actions
#[derive(Debug)]
pub struct ExpiryScheduler {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    clock: Arc<dyn Clock>,
}

impl ExpiryScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
            clock,
        }
    }

    /// Install a timer for `key`, replacing any previous one
    pub fn schedule(&self, key: &str, version: u64, deadline: u64) {
        let mut state = self.state.lock();
        let earliest = state.heap.peek().map(|Reverse(t)| t.deadline);

        state.pending.insert(key.to_string(), version);
        state.heap.push(Reverse(Timer {
            deadline,
            version,
            key: key.to_string(),
        }));

        if state.heap.len() > state.pending.len() * 2 + COMPACT_SLACK {
            Self::compact(&mut state);
        }

        if earliest.map_or(true, |e| deadline < e) {
            self.wakeup.notify_all();
        }
    }

    /// Cancel the timer for `key`; returns whether one was pending
    pub fn cancel(&self, key: &str) -> bool {
        self.state.lock().pending.remove(key).is_some()
    }

    /// Remove and return timers due at `now_ms` that are still live
    pub fn take_due(&self, now_ms: u64) -> Vec<(String, u64)> {
        let mut state = self.state.lock();
        let mut due = Vec::new();

        while let Some(Reverse(timer)) = state.heap.peek() {
            if timer.deadline > now_ms {
                break;
            }
            let Some(Reverse(timer)) = state.heap.pop() else {
                break;
            };
            if state.pending.get(&timer.key) == Some(&timer.version) {
                state.pending.remove(&timer.key);
                due.push((timer.key, timer.version));
            }
        }

        due
    }

    /// Number of live timers
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Drop every timer (used when the store shuts down)
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.heap.clear();
        state.pending.clear();
    }

    /// Block until the next deadline, `max_wait`, a new earlier timer or
    /// shutdown. Returns `false` once shut down.
    fn wait(&self, max_wait: Duration) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }

        let now = self.clock.now_ms();
        let wait = match state.heap.peek() {
            Some(Reverse(t)) if t.deadline <= now => return true,
            Some(Reverse(t)) => max_wait.min(Duration::from_millis(t.deadline - now)),
            None => max_wait,
        };

        self.wakeup.wait_for(&mut state, wait);
        !state.shutdown
    }

    fn begin_shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wakeup.notify_all();
    }

    fn reset_shutdown(&self) {
        self.state.lock().shutdown = false;
    }

    fn compact(state: &mut TimerState) {
        let live: Vec<Reverse<Timer>> = std::mem::take(&mut state.heap)
            .into_iter()
            .filter(|Reverse(t)| state.pending.get(&t.key) == Some(&t.version))
            .collect();
        state.heap = BinaryHeap::from(live);
    }
}

/// Handle to the background eviction thread
pub struct ExpiryWorker {
    scheduler: Arc<ExpiryScheduler>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ExpiryWorker {
    /// Start evicting due entries of `keyspace`
    pub fn spawn(keyspace: Arc<KeySpace>, poll: Duration) -> std::io::Result<Self> {
        let scheduler = Arc::clone(keyspace.scheduler());
        scheduler.reset_shutdown();

        let thread = thread::Builder::new()
            .name("cairnkv-expiry".to_string())
            .spawn(move || {
                tracing::debug!("Expiry worker started");
                let scheduler = Arc::clone(keyspace.scheduler());
                while scheduler.wait(poll) {
                    let evicted = keyspace.run_expirations();
                    if evicted > 0 {
                        tracing::debug!("Evicted {} expired entries", evicted);
                    }
                }
                tracing::debug!("Expiry worker stopped");
            })?;

        Ok(Self {
            scheduler,
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.scheduler.begin_shutdown();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("Expiry worker panicked");
            }
        }
    }
}

impl Drop for ExpiryWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
