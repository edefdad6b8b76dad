use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::bucket::WheelBucket;
use super::clock::SleepRounding;
use super::task::TimerEntry;
use super::{TimerShared, TimerState};
use crate::executor::{panic_message, Executor, Job};

thread_local! {
    /// Id of the timer whose callback is running on this thread, if any.
    static RUNNING_TIMER: Cell<Option<u64>> = const { Cell::new(None) };
}

pub(super) fn running_timer() -> Option<u64> {
    RUNNING_TIMER.with(Cell::get)
}

/// Marks the current thread as running a callback of `timer_id` until dropped.
struct CallbackScope {
    previous: Option<u64>,
}

impl CallbackScope {
    fn enter(timer_id: u64) -> Self {
        let previous = RUNNING_TIMER.with(|c| c.replace(Some(timer_id)));
        Self { previous }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        RUNNING_TIMER.with(|c| c.set(self.previous));
    }
}

/// State owned by the worker thread. Buckets are never shared.
pub(super) struct Worker {
    shared: Arc<TimerShared>,
    executor: Arc<dyn Executor>,
    wheel: Vec<WheelBucket>,
    mask: u64,
    tick_nanos: u64,
    max_transfer: usize,
    rounding: SleepRounding,
    tick: u64,
    /// Live keyed entries: key -> (bucket index, slot).
    keyed: HashMap<i64, (usize, usize)>,
}

impl Worker {
    pub(super) fn new(
        shared: Arc<TimerShared>,
        executor: Arc<dyn Executor>,
        wheel_len: usize,
        tick_nanos: u64,
        max_transfer: usize,
        rounding: SleepRounding,
    ) -> Self {
        Self {
            shared,
            executor,
            wheel: (0..wheel_len).map(|_| WheelBucket::new()).collect(),
            mask: wheel_len as u64 - 1,
            tick_nanos,
            max_transfer,
            rounding,
            tick: 0,
            keyed: HashMap::new(),
        }
    }

    pub(super) fn run(mut self) {
        // Zero is reserved for "not started yet".
        let epoch = self.shared.clock.now_nanos().max(1);
        self.shared.publish_start(epoch);
        debug!(timer = self.shared.id, "wheel worker started");

        while self.shared.state() == TimerState::Started {
            if !self.wait_for_next_tick(epoch) {
                break;
            }
            let idx = (self.tick & self.mask) as usize;
            self.transfer_pending();
            self.expire_bucket(idx);
            self.tick += 1;
        }

        let bucketed: usize = self.wheel.iter_mut().map(WheelBucket::clear).sum();
        let pending = self.shared.drain_pending();
        self.keyed.clear();
        debug!(
            timer = self.shared.id,
            ticks = self.tick,
            bucketed,
            pending,
            "wheel worker stopped, unprocessed tasks discarded"
        );
    }

    /// Sleep until the end of the current tick. Returns `false` on shutdown.
    fn wait_for_next_tick(&self, epoch: u64) -> bool {
        let boundary = self.tick_nanos.saturating_mul(self.tick + 1);
        loop {
            let elapsed = self.shared.clock.now_nanos().saturating_sub(epoch);
            if elapsed >= boundary {
                return true;
            }
            if self.shared.state() != TimerState::Started {
                return false;
            }
            let sleep = self
                .rounding
                .coarsen(Duration::from_nanos(boundary - elapsed));
            thread::park_timeout(sleep);
        }
    }

    fn transfer_pending(&mut self) {
        for _ in 0..self.max_transfer {
            let Some(entry) = self.shared.pending.pop() else {
                break;
            };
            if entry.is_cancelled() {
                continue;
            }
            self.place(entry);
        }
    }

    fn place(&mut self, entry: TimerEntry) {
        let calculated = entry.deadline_nanos() / self.tick_nanos;
        // Already overdue entries go into the current bucket.
        let target = calculated.max(self.tick);
        let rounds = (target - self.tick) / self.wheel.len() as u64;
        let idx = (target & self.mask) as usize;

        let Some(key) = entry.key() else {
            self.wheel[idx].push_back(entry, rounds);
            return;
        };

        let entry = match self.keyed.get(&key).copied() {
            Some((bucket, slot)) => {
                let same_deadline = self.wheel[bucket]
                    .get(slot)
                    .is_some_and(|old| old.deadline_nanos() == entry.deadline_nanos());
                if same_deadline {
                    match self.wheel[bucket].replace(slot, entry) {
                        Ok(old) => {
                            supersede(old);
                            return;
                        }
                        Err(entry) => entry,
                    }
                } else {
                    if let Some(old) = self.wheel[bucket].remove(slot) {
                        supersede(old);
                    }
                    entry
                }
            }
            None => entry,
        };

        let slot = self.wheel[idx].push_back(entry, rounds);
        self.keyed.insert(key, (idx, slot));
    }

    fn expire_bucket(&mut self, idx: usize) {
        let timer_id = self.shared.id;
        let keyed = &mut self.keyed;
        let executor = self.executor.as_ref();
        self.wheel[idx].expire(|slot, entry| {
            if let Some(key) = entry.key() {
                if keyed.get(&key) == Some(&(idx, slot)) {
                    keyed.remove(&key);
                }
            }
            if !entry.is_cancelled() {
                dispatch(timer_id, executor, entry);
            }
        });
    }
}

fn supersede(old: TimerEntry) {
    old.handle.cancel();
    debug!(
        task_id = old.handle.id(),
        key = old.key(),
        "keyed task replaced by a newer one"
    );
}

fn dispatch(timer_id: u64, executor: &dyn Executor, entry: TimerEntry) {
    let task_id = entry.handle.id();
    let job: Job = Box::new(move || run_callback(timer_id, entry));
    if let Err(e) = executor.execute(job) {
        error!(task_id, code = e.code(), "timer task was not executed: {}", e);
    }
}

fn run_callback(timer_id: u64, entry: TimerEntry) {
    let _scope = CallbackScope::enter(timer_id);
    let TimerEntry { handle, callback } = entry;
    // Claimed on the running thread, so a rejected submission leaves it in Init.
    if !handle.try_execute() {
        return;
    }
    match catch_unwind(AssertUnwindSafe(|| callback(&handle))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task_id = handle.id(), "timer task failed: {:#}", e),
        Err(p) => error!(
            task_id = handle.id(),
            "timer task panicked: {}",
            panic_message(p.as_ref())
        ),
    }
}
