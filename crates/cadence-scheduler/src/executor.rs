//! Bounded worker pool that runs job bodies off the timer thread.
//!
//! `WorkExecutor` owns a fixed set of named OS threads fed by a bounded
//! crossbeam channel. A full queue is reported to the caller as
//! [`SchedulerError::Rejected`]; the pool never retries or backs off on its
//! own. Panics inside a job are caught and logged so one bad job cannot take
//! a worker down.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use cadence_core::config::ExecutorSettings;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};

/// A unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs, typically on another thread.
pub trait Executor: Send + Sync {
    /// Run `job` eventually. Errors mean the job will never run.
    fn execute(&self, job: Job) -> Result<()>;
}

/// Runs each job immediately on the calling thread.
///
/// Useful for cheap callbacks and for tests; with a [`crate::WheelTimer`] it
/// means callbacks run on the timer's worker thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        run_guarded(job);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Thread names are `{name_prefix}-{n}`.
    pub name_prefix: String,
    /// Number of worker threads (core size == max size).
    pub pool_size: usize,
    /// Jobs that may wait for a free worker before submissions are rejected.
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&ExecutorSettings::default())
    }
}

impl From<&ExecutorSettings> for ExecutorConfig {
    fn from(s: &ExecutorSettings) -> Self {
        Self {
            name_prefix: s.name_prefix.clone(),
            pool_size: s.pool_size,
            queue_capacity: s.queue_capacity,
        }
    }
}

pub struct WorkExecutor {
    name: String,
    /// `None` once shut down; dropping the sender lets workers drain and exit.
    sender: RwLock<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
    shutdown: AtomicBool,
}

impl WorkExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(SchedulerError::InvalidArgument(
                "pool_size must be > 0".to_string(),
            ));
        }
        if config.queue_capacity == 0 {
            return Err(SchedulerError::InvalidArgument(
                "queue_capacity must be > 0".to_string(),
            ));
        }

        let (tx, rx) = channel::bounded::<Job>(config.queue_capacity);
        let active = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(config.pool_size);
        for n in 0..config.pool_size {
            let rx = rx.clone();
            let active = Arc::clone(&active);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.name_prefix, n))
                .spawn(move || worker_loop(rx, active))?;
            workers.push(handle);
        }

        info!(
            pool = %config.name_prefix,
            threads = config.pool_size,
            queue = config.queue_capacity,
            "work executor started"
        );

        Ok(Self {
            name: config.name_prefix,
            sender: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
            active,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Queue a job. Fails with `Rejected` when the queue is full.
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(f))
    }

    /// Queue a job and get a handle to its result.
    ///
    /// The returned [`JobFuture`] can be `.await`ed or waited on with
    /// [`JobFuture::wait`]. It resolves to `JobFailed` if the job panicked.
    pub fn submit<F, T>(&self, f: F) -> Result<JobFuture<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f))
                .map_err(|p| SchedulerError::JobFailed(panic_message(p.as_ref())));
            // The caller may have dropped the future; nobody to tell.
            let _ = tx.send(outcome);
        }))?;
        Ok(JobFuture { rx })
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        let guard = self.sender.read();
        let Some(tx) = guard.as_ref() else {
            return Err(SchedulerError::IllegalState(format!(
                "executor '{}' is shut down",
                self.name
            )));
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(pool = %self.name, queued = tx.len(), "job queue full, rejecting");
                Err(SchedulerError::Rejected {
                    reason: format!("executor '{}' queue is full", self.name),
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(SchedulerError::IllegalState(format!(
                "executor '{}' has no workers",
                self.name
            ))),
        }
    }

    /// Jobs currently running.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Jobs waiting for a worker.
    pub fn queued_count(&self) -> usize {
        self.sender.read().as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work, let queued jobs finish, and join the workers.
    ///
    /// Idempotent. When called from one of the pool's own threads that thread
    /// is not joined (it would wait on itself).
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pool = %self.name, "work executor shutting down");
        self.sender.write().take();

        let me = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "worker thread exited abnormally");
            }
        }
        debug!(pool = %self.name, "work executor stopped");
    }
}

impl Executor for WorkExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        self.enqueue(job)
    }
}

impl Drop for WorkExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Job>, active: Arc<AtomicUsize>) {
    // recv() fails once the sender is dropped and the queue is drained.
    while let Ok(job) = rx.recv() {
        active.fetch_add(1, Ordering::AcqRel);
        run_guarded(job);
        active.fetch_sub(1, Ordering::AcqRel);
    }
}

fn run_guarded(job: Job) {
    if let Err(p) = catch_unwind(AssertUnwindSafe(job)) {
        let current = thread::current();
        error!(
            thread = current.name().unwrap_or("unnamed"),
            "job panicked: {}",
            panic_message(p.as_ref())
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Result of a job queued with [`WorkExecutor::submit`].
#[must_use = "dropping a JobFuture discards the job's result"]
pub struct JobFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> JobFuture<T> {
    /// Block the current thread until the job finishes.
    ///
    /// Must not be called from inside an async runtime; `.await` instead.
    pub fn wait(self) -> Result<T> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(dropped()))
    }
}

impl<T> Future for JobFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(dropped())))
    }
}

fn dropped() -> SchedulerError {
    SchedulerError::JobFailed("job was dropped before it ran".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn small_pool(threads: usize, queue: usize) -> WorkExecutor {
        WorkExecutor::new(ExecutorConfig {
            name_prefix: "test-job".to_string(),
            pool_size: threads,
            queue_capacity: queue,
        })
        .unwrap()
    }

    #[test]
    fn submit_returns_job_result() {
        let pool = small_pool(2, 8);
        let fut = pool.submit(|| 6 * 7).unwrap();
        assert_eq!(fut.wait().unwrap(), 42);
    }

    #[test]
    fn jobs_run_on_named_threads() {
        let pool = small_pool(1, 8);
        let name = pool
            .submit(|| thread::current().name().map(str::to_string))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-job-0"));
    }

    #[test]
    fn panicking_job_is_isolated() {
        let pool = small_pool(1, 8);
        let failed = pool.submit(|| -> u32 { panic!("boom") }).unwrap().wait();
        match failed {
            Err(SchedulerError::JobFailed(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected JobFailed, got {:?}", other.map(|_| ())),
        }
        // The single worker survived.
        assert_eq!(pool.submit(|| 1).unwrap().wait().unwrap(), 1);
    }

    #[test]
    fn full_queue_rejects() {
        let pool = small_pool(1, 1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        pool.execute(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.active_count(), 1);

        // One slot in the queue, then rejection.
        pool.execute(|| {}).unwrap();
        let err = pool.execute(|| {}).unwrap_err();
        assert_eq!(err.code(), "REJECTED");
        assert_eq!(pool.queued_count(), 1);

        release_tx.send(()).unwrap();
    }

    #[test]
    fn shutdown_drains_queue_and_is_idempotent() {
        let pool = small_pool(2, 64);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let done = Arc::clone(&done);
            pool.execute(move || {
                thread::sleep(Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 32);
        assert!(pool.is_shutdown());
        assert_eq!(pool.execute(|| {}).unwrap_err().code(), "ILLEGAL_STATE");
    }

    #[tokio::test]
    async fn job_future_can_be_awaited() {
        let pool = small_pool(1, 4);
        let value = pool.submit(|| "done").unwrap().await.unwrap();
        assert_eq!(value, "done");
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let err = WorkExecutor::new(ExecutorConfig {
            pool_size: 0,
            ..ExecutorConfig::default()
        })
        .err()
        .unwrap();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }
}
