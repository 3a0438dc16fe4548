use futures::{Stream, StreamExt};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

static NEXT_FEED_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Feed whose callback is running on this thread, if any.
    static DELIVERING: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Cancellation handle for a live feed.
///
/// `cancel` runs the unsubscribe action once; dropping an uncancelled handle
/// does the same.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Spawns a task that drains `snapshots` into `callback`.
    ///
    /// Deliveries run under a gate that `cancel` also takes, so once `cancel`
    /// returns no callback is running or will start. Cancelling from inside
    /// the callback itself skips the wait.
    pub fn spawn<T, S, F>(snapshots: S, callback: F) -> Self
    where
        T: Send + 'static,
        S: Stream<Item = T> + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = NEXT_FEED_ID.fetch_add(1, Ordering::Relaxed);
        let open = Arc::new(AtomicBool::new(true));
        let gate = Arc::new(Mutex::new(()));
        let (task_open, task_gate) = (Arc::clone(&open), Arc::clone(&gate));

        let task: JoinHandle<()> = tokio::spawn(async move {
            futures::pin_mut!(snapshots);
            while let Some(snapshot) = snapshots.next().await {
                let _delivering = task_gate.lock().unwrap_or_else(PoisonError::into_inner);
                if !task_open.load(Ordering::SeqCst) {
                    break;
                }
                DELIVERING.with(|current| current.set(Some(id)));
                callback(snapshot);
                DELIVERING.with(|current| current.set(None));
            }
        });

        Self::new(move || {
            open.store(false, Ordering::SeqCst);
            if DELIVERING.with(Cell::get) != Some(id) {
                drop(gate.lock().unwrap_or_else(PoisonError::into_inner));
            }
            task.abort();
        })
    }

    pub fn cancel(mut self) {
        self.run_unsubscribe();
    }

    fn run_unsubscribe(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
