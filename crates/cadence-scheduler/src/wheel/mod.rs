//! Hashed time wheel for one-shot delayed tasks.
//!
//! A single worker thread advances the wheel one tick at a time. Callers
//! enqueue tasks on a lock-free queue from any thread; the worker moves them
//! into buckets at the start of each tick, then expires the current bucket and
//! hands due callbacks to an [`Executor`]. Accuracy is bounded by the tick
//! duration: a task never fires before its deadline and typically fires
//! within one tick after it.
//!
//! | Type | Role |
//! |------|------|
//! | [`WheelTimer`] | Owner of the worker thread and the public API |
//! | [`TaskHandle`] | Cancellation and status of one scheduled task |
//! | [`Clock`] | Time source, [`MonotonicClock`] by default |
//! | [`SleepRounding`] | How tick waits are rounded for the platform |

mod bucket;
mod clock;
mod task;
mod worker;

pub use clock::{Clock, MonotonicClock, SleepRounding};
pub use task::{Callback, TaskHandle, TaskState};

use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cadence_core::config::{WheelSettings, MAX_TICKS_PER_WHEEL};
use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SchedulerError};
use crate::executor::Executor;
use task::TimerEntry;
use worker::Worker;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a [`WheelTimer`]. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimerState {
    Init = 0,
    Started = 1,
    Shutdown = 2,
}

impl TimerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TimerState::Started,
            2 => TimerState::Shutdown,
            _ => TimerState::Init,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WheelConfig {
    /// Name of the single worker thread.
    pub thread_name: String,
    pub tick_duration: Duration,
    /// Rounded up to the next power of two.
    pub ticks_per_wheel: u32,
    /// Cap on pending tasks moved into buckets per tick.
    pub max_transfer_per_tick: usize,
    pub sleep_rounding: SleepRounding,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self::from(&WheelSettings::default())
    }
}

impl From<&WheelSettings> for WheelConfig {
    fn from(s: &WheelSettings) -> Self {
        Self {
            thread_name: s.thread_name.clone(),
            tick_duration: Duration::from_millis(s.tick_duration_ms),
            ticks_per_wheel: s.ticks_per_wheel,
            max_transfer_per_tick: s.max_transfer_per_tick,
            sleep_rounding: SleepRounding::platform_default(),
        }
    }
}

/// State visible to both callers and the worker thread.
pub(crate) struct TimerShared {
    id: u64,
    state: AtomicU8,
    /// Clock reading when the worker started; deadlines are relative to it.
    start_epoch: OnceLock<u64>,
    latch: Mutex<()>,
    started: Condvar,
    pending: SegQueue<TimerEntry>,
    clock: Arc<dyn Clock>,
    next_task_id: AtomicU64,
}

impl TimerShared {
    fn state(&self) -> TimerState {
        TimerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: TimerState, to: TimerState) -> std::result::Result<(), TimerState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TimerState::from_u8)
    }

    fn publish_start(&self, epoch: u64) {
        let _ = self.start_epoch.set(epoch);
        let _guard = self.latch.lock();
        self.started.notify_all();
    }

    /// Block until the worker has published its start epoch.
    fn await_start(&self) -> Result<u64> {
        let mut guard = self.latch.lock();
        loop {
            if let Some(epoch) = self.start_epoch.get() {
                return Ok(*epoch);
            }
            if self.state() == TimerState::Shutdown {
                return Err(SchedulerError::IllegalState(
                    "timer stopped before its worker started".to_string(),
                ));
            }
            self.started.wait_for(&mut guard, Duration::from_millis(50));
        }
    }

    fn drain_pending(&self) -> usize {
        let mut dropped = 0;
        while self.pending.pop().is_some() {
            dropped += 1;
        }
        dropped
    }
}

/// One-shot delayed task scheduler backed by a hashed time wheel.
///
/// The worker thread is started lazily by the first `add_task*` call, or
/// explicitly with [`WheelTimer::start`]. A stopped timer cannot be restarted.
pub struct WheelTimer {
    shared: Arc<TimerShared>,
    thread_name: String,
    /// Moved onto the worker thread by `start`.
    worker: Mutex<Option<Worker>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WheelTimer {
    pub fn new(config: WheelConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        Self::with_clock(config, executor, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        config: WheelConfig,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let tick_nanos = u64::try_from(config.tick_duration.as_nanos()).unwrap_or(u64::MAX);
        if tick_nanos == 0 {
            return Err(invalid("tick_duration must be > 0"));
        }
        if config.ticks_per_wheel == 0 || config.ticks_per_wheel > MAX_TICKS_PER_WHEEL {
            return Err(invalid(format!(
                "ticks_per_wheel must be in 1..={MAX_TICKS_PER_WHEEL}, got {}",
                config.ticks_per_wheel
            )));
        }
        if config.max_transfer_per_tick == 0 {
            return Err(invalid("max_transfer_per_tick must be > 0"));
        }
        let wheel_len = config.ticks_per_wheel.next_power_of_two();
        if tick_nanos.checked_mul(u64::from(wheel_len)).is_none() {
            return Err(invalid(format!(
                "tick_duration {:?} overflows a wheel of {wheel_len} ticks",
                config.tick_duration
            )));
        }

        let shared = Arc::new(TimerShared {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(TimerState::Init as u8),
            start_epoch: OnceLock::new(),
            latch: Mutex::new(()),
            started: Condvar::new(),
            pending: SegQueue::new(),
            clock,
            next_task_id: AtomicU64::new(1),
        });
        let worker = Worker::new(
            Arc::clone(&shared),
            executor,
            wheel_len as usize,
            tick_nanos,
            config.max_transfer_per_tick,
            config.sleep_rounding,
        );

        debug!(
            thread = %config.thread_name,
            tick = ?config.tick_duration,
            ticks = wheel_len,
            "wheel timer created"
        );
        Ok(Self {
            shared,
            thread_name: config.thread_name,
            worker: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
        })
    }

    /// Start the worker thread and wait until it is ticking.
    ///
    /// A no-op if already started. Fails once the timer has been stopped.
    pub fn start(&self) -> Result<()> {
        self.ensure_started().map(|_| ())
    }

    fn ensure_started(&self) -> Result<u64> {
        match self.shared.transition(TimerState::Init, TimerState::Started) {
            Ok(()) => self.spawn_worker()?,
            Err(TimerState::Shutdown) => {
                return Err(SchedulerError::IllegalState(
                    "timer cannot be started once stopped".to_string(),
                ))
            }
            Err(_) => {}
        }
        self.shared.await_start()
    }

    fn spawn_worker(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                info!(thread = %self.thread_name, "wheel timer started");
                Ok(())
            }
            Err(e) => {
                self.shared
                    .state
                    .store(TimerState::Shutdown as u8, Ordering::Release);
                let _guard = self.shared.latch.lock();
                self.shared.started.notify_all();
                Err(e.into())
            }
        }
    }

    /// Run `callback` once after `delay`.
    pub fn add_task<F>(&self, callback: F, delay: Duration) -> Result<TaskHandle>
    where
        F: FnOnce(&TaskHandle) -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule(None, Box::new(callback), delay)
    }

    /// Run `callback` once at wall-clock instant `at`; past instants fire on
    /// the next tick.
    pub fn add_task_at<F>(&self, callback: F, at: DateTime<Utc>) -> Result<TaskHandle>
    where
        F: FnOnce(&TaskHandle) -> anyhow::Result<()> + Send + 'static,
    {
        let delay = (at - self.shared.clock.now_utc())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.schedule(None, Box::new(callback), delay)
    }

    /// Like [`add_task`](Self::add_task), but at most one task per `key` is
    /// kept in the wheel.
    ///
    /// A newer task with the same key and deadline takes the older one's place;
    /// with a different deadline the older one is unlinked. Either way the
    /// older task is cancelled and never runs.
    pub fn add_keyed_task<F>(&self, key: i64, callback: F, delay: Duration) -> Result<TaskHandle>
    where
        F: FnOnce(&TaskHandle) -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule(Some(key), Box::new(callback), delay)
    }

    fn schedule(&self, key: Option<i64>, callback: Callback, delay: Duration) -> Result<TaskHandle> {
        let epoch = self.ensure_started()?;
        let delay = u64::try_from(delay.as_nanos())
            .map_err(|_| invalid(format!("delay {delay:?} is too large")))?;
        let deadline = self
            .shared
            .clock
            .now_nanos()
            .saturating_sub(epoch)
            .checked_add(delay)
            .ok_or_else(|| invalid("task deadline overflows the timer clock"))?;

        let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(id, key, deadline);
        self.shared
            .pending
            .push(TimerEntry::new(handle.clone(), callback));
        // Pairs with the fence in `stop`: either its drain sees this entry or
        // this load sees the shutdown.
        fence(Ordering::SeqCst);
        if self.shared.state() != TimerState::Started {
            self.shared.drain_pending();
            return Err(SchedulerError::IllegalState(
                "timer stopped while the task was being queued".to_string(),
            ));
        }
        trace!(task_id = id, key, deadline_ns = deadline, "timer task queued");
        Ok(handle)
    }

    /// Stop the worker and discard every task that has not been dispatched.
    ///
    /// Discarded tasks keep state [`TaskState::Init`]. An `add_task*` call
    /// that races with `stop` either lands before the drain and is discarded,
    /// or fails with `ILLEGAL_STATE`; no entry is left queued on a stopped
    /// timer. Stopping a timer that
    /// was never started, or stopping twice, does nothing. Fails when called
    /// from this timer's own worker thread or from one of its callbacks.
    pub fn stop(&self) -> Result<()> {
        if worker::running_timer() == Some(self.shared.id) {
            return Err(SchedulerError::IllegalState(
                "WheelTimer::stop() cannot be called from a timer task".to_string(),
            ));
        }
        let me = thread::current().id();
        if self
            .handle
            .lock()
            .as_ref()
            .is_some_and(|h| h.thread().id() == me)
        {
            return Err(SchedulerError::IllegalState(
                "WheelTimer::stop() cannot be called from the wheel worker".to_string(),
            ));
        }
        if self
            .shared
            .transition(TimerState::Started, TimerState::Shutdown)
            .is_err()
        {
            return Ok(());
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            while !handle.is_finished() {
                handle.thread().unpark();
                thread::sleep(Duration::from_millis(1));
            }
            if handle.join().is_err() {
                warn!(thread = %self.thread_name, "wheel worker exited abnormally");
            }
        }
        // Tasks queued while the worker was shutting down. A caller that
        // pushes after this drain sees Shutdown and drains its own entry.
        fence(Ordering::SeqCst);
        let stranded = self.shared.drain_pending();
        info!(thread = %self.thread_name, stranded, "wheel timer stopped");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == TimerState::Shutdown
    }

    pub fn state(&self) -> TimerState {
        self.shared.state()
    }

    /// Tasks queued but not yet moved into a bucket.
    pub fn pending_task_count(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Drop for WheelTimer {
    fn drop(&mut self) {
        if self.stop().is_err() {
            // Dropped on the worker or inside a callback: signal and detach.
            self.shared
                .state
                .store(TimerState::Shutdown as u8, Ordering::Release);
            if let Some(handle) = self.handle.lock().as_ref() {
                handle.thread().unpark();
            }
        }
    }
}

fn invalid(msg: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidArgument(msg.into())
}
