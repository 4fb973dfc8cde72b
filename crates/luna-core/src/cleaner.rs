//! Deferred finalizer queue
//!
//! Every handle registers a release action and receives a [`Tracker`]
//! token. Dropping the token reports it unreachable over a channel; a
//! single worker thread removes it from the live set and runs its action.
//! Actions never run on the thread that dropped the handle, so a drop
//! inside a locked session region cannot deadlock on the same lock.

use crossbeam::channel::{self, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

type Action = Box<dyn FnOnce() + Send>;

enum Message {
    Collected(u64),
    Shutdown,
}

static GLOBAL: Lazy<Arc<Cleaner>> = Lazy::new(|| Arc::new(Cleaner::new()));

/// The process-wide finalizer queue used by default
pub fn global() -> Arc<Cleaner> {
    GLOBAL.clone()
}

/// Unreachability token
///
/// Dropping it schedules the associated release action.
pub struct Tracker {
    id: u64,
    sender: Sender<Message>,
}

impl Tracker {
    /// Token id within its queue
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        // The worker may already be gone after shutdown
        let _ = self.sender.send(Message::Collected(self.id));
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tracker({})", self.id)
    }
}

/// Background worker reclaiming resources of unreachable handles
pub struct Cleaner {
    sender: Sender<Message>,
    live: Arc<Mutex<FxHashMap<u64, Action>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Cleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl Cleaner {
    /// Create a queue and start its worker thread
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        let live: Arc<Mutex<FxHashMap<u64, Action>>> = Arc::default();

        let worker_live = live.clone();
        let worker = thread::Builder::new()
            .name("luna-cleaner".to_string())
            .spawn(move || run_worker(receiver, worker_live));

        let (worker, closed) = match worker {
            Ok(handle) => (Some(handle), false),
            Err(err) => {
                warn!(error = %err, "failed to start finalizer worker");
                (None, true)
            }
        };

        Self {
            sender,
            live,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(closed),
            worker: Mutex::new(worker),
        }
    }

    /// Register a release action and return its tracking token
    ///
    /// After [`Cleaner::close`] the action is dropped without running.
    pub fn register<F>(&self, action: F) -> Tracker
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.closed.load(Ordering::Acquire) {
            self.live.lock().insert(id, Box::new(action));
        }
        Tracker {
            id,
            sender: self.sender.clone(),
        }
    }

    /// Number of registered actions still waiting for their token
    pub fn pending(&self) -> usize {
        self.live.lock().len()
    }

    /// Check if the worker has been stopped
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the worker
    ///
    /// Pending actions are abandoned. Must not be called while holding a
    /// session lock the worker may be waiting for.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(Message::Shutdown);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        let abandoned = std::mem::take(&mut *self.live.lock()).len();
        debug!(abandoned, "finalizer queue closed");
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleaner")
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn run_worker(receiver: Receiver<Message>, live: Arc<Mutex<FxHashMap<u64, Action>>>) {
    for message in receiver.iter() {
        match message {
            Message::Collected(id) => {
                let action = live.lock().remove(&id);
                if let Some(action) = action {
                    trace!(id, "running release action");
                    action();
                }
            }
            Message::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_drop_runs_action() {
        let cleaner = Cleaner::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let tracker = cleaner.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(cleaner.pending(), 1);

        drop(tracker);
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1));
        assert!(wait_until(|| cleaner.pending() == 0));
    }

    #[test]
    fn test_live_tracker_keeps_action() {
        let cleaner = Cleaner::new();
        let _tracker = cleaner.register(|| {});
        thread::sleep(Duration::from_millis(20));
        assert_eq!(cleaner.pending(), 1);
    }

    #[test]
    fn test_close_abandons_pending() {
        let cleaner = Cleaner::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let tracker = cleaner.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        cleaner.close();
        cleaner.close();
        assert!(cleaner.is_closed());
        assert_eq!(cleaner.pending(), 0);

        drop(tracker);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_register_after_close() {
        let cleaner = Cleaner::new();
        cleaner.close();
        let tracker = cleaner.register(|| {});
        assert_eq!(cleaner.pending(), 0);
        drop(tracker);
    }
}
