//! Bounded-concurrency async task scheduler.
//!
//! Runs a lazy sequence of jobs with at most `limit` in flight: the next
//! job is pulled only when a running one finishes, so the window slides
//! continuously instead of advancing in batches. [`TaskScheduler::terminate`]
//! aborts in-flight jobs, stops pulling new ones, and returns only after
//! every job has actually unwound.
//!
//! A failure inside one job never cancels its siblings; jobs carry their
//! own error reporting (the download engine records failures per transfer
//! unit).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Error type for scheduler construction.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Concurrency limit must be at least 1.
    #[error("invalid concurrency limit {value}: must be at least 1")]
    InvalidLimit { value: usize },
}

/// Bounded-concurrency task runner with full-drain termination.
///
/// Cloning is cheap and shares the same window and termination state, so a
/// controller task can call [`terminate`](Self::terminate) while another
/// task is inside [`run`](Self::run).
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
    limit: usize,
}

#[derive(Debug)]
struct Inner {
    semaphore: Arc<Semaphore>,
    running: AtomicUsize,
    drained: Notify,
    terminated: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Decrements the running count when the job future is dropped, whether it
/// completed or was aborted mid-await.
struct RunningGuard(Arc<Inner>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
        self.0.drained.notify_waiters();
    }
}

impl TaskScheduler {
    /// Creates a scheduler with the given concurrency limit.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidLimit`] when `limit` is zero.
    pub fn new(limit: usize) -> Result<Self, SchedulerError> {
        if limit == 0 {
            return Err(SchedulerError::InvalidLimit { value: limit });
        }
        Ok(Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(limit)),
                running: AtomicUsize::new(0),
                drained: Notify::new(),
                terminated: AtomicBool::new(false),
                handles: Mutex::new(Vec::new()),
            }),
            limit,
        })
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether [`terminate`](Self::terminate) has been requested.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Number of jobs currently in flight.
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Runs all jobs from the iterator and waits for the window to drain.
    ///
    /// Jobs are pulled lazily: each is taken from the iterator only once a
    /// permit is available. Returns early (after draining jobs already in
    /// flight) when the scheduler is terminated concurrently.
    pub async fn run<I, F>(&self, jobs: I)
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = ()> + Send + 'static,
    {
        for job in jobs {
            // A closed semaphore means terminate() ran; stop pulling.
            let Ok(permit) = Arc::clone(&self.inner.semaphore).acquire_owned().await else {
                break;
            };
            if self.is_terminated() {
                break;
            }

            self.inner.running.fetch_add(1, Ordering::SeqCst);
            let guard_inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(async move {
                let _guard = RunningGuard(guard_inner);
                let _permit = permit;
                job.await;
            });

            let mut handles = self.inner.handles.lock().await;
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }

        self.wait_drained().await;
        debug!(limit = self.limit, "scheduler drained");
    }

    /// Cancels all in-flight jobs, stops pulling new ones, and returns only
    /// after every job has unwound. Safe to call concurrently with normal
    /// completion; later calls are no-ops that still wait for the drain.
    pub async fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();

        // A job may be spawned between its permit acquisition and this
        // snapshot; loop until nothing remains rather than aborting once.
        loop {
            let handles = std::mem::take(&mut *self.inner.handles.lock().await);
            if handles.is_empty() && self.running() == 0 {
                break;
            }
            debug!(in_flight = handles.len(), "terminating scheduler");
            for handle in &handles {
                handle.abort();
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!(error = %e, "scheduled job panicked");
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        self.wait_drained().await;
        debug!("scheduler terminated");
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.running.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    }
}
