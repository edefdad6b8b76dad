use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Body of a timer task. Errors are logged by the timer, never propagated.
pub type Callback = Box<dyn FnOnce(&TaskHandle) -> anyhow::Result<()> + Send + 'static>;

/// Lifecycle of one scheduled task. `Cancelled` and `Executed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Init = 0,
    Cancelled = 1,
    Executed = 2,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskState::Cancelled,
            2 => TaskState::Executed,
            _ => TaskState::Init,
        }
    }
}

#[derive(Debug)]
struct TaskShared {
    id: u64,
    key: Option<i64>,
    /// Nanoseconds after the timer's start epoch.
    deadline: u64,
    state: AtomicU8,
}

/// Caller-side handle to a scheduled task.
///
/// Cheap to clone; every clone observes the same state.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub(crate) fn new(id: u64, key: Option<i64>, deadline: u64) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id,
                key,
                deadline,
                state: AtomicU8::new(TaskState::Init as u8),
            }),
        }
    }

    /// Timer-local sequence number.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// De-duplication key, for tasks added with `add_keyed_task`.
    pub fn key(&self) -> Option<i64> {
        self.shared.key
    }

    /// Due time, measured from the timer's start epoch.
    pub fn deadline(&self) -> Duration {
        Duration::from_nanos(self.shared.deadline)
    }

    pub(crate) fn deadline_nanos(&self) -> u64 {
        self.shared.deadline
    }

    /// Cancel the task if its callback has not started.
    ///
    /// Returns `true` only for the call that actually cancelled it. The entry
    /// is unlinked from its bucket lazily by the worker.
    pub fn cancel(&self) -> bool {
        self.transition(TaskState::Cancelled)
    }

    /// Claim the task for execution. Loses to an earlier `cancel`.
    pub(crate) fn try_execute(&self) -> bool {
        self.transition(TaskState::Executed)
    }

    fn transition(&self, to: TaskState) -> bool {
        self.shared
            .state
            .compare_exchange(
                TaskState::Init as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    pub fn is_executed(&self) -> bool {
        self.state() == TaskState::Executed
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("key", &self.shared.key)
            .field("deadline", &self.deadline())
            .field("state", &self.state())
            .finish()
    }
}

/// A task as stored in the pending queue and in buckets.
pub(crate) struct TimerEntry {
    pub(crate) handle: TaskHandle,
    pub(crate) callback: Callback,
}

impl TimerEntry {
    pub(crate) fn new(handle: TaskHandle, callback: Callback) -> Self {
        Self { handle, callback }
    }

    pub(crate) fn deadline_nanos(&self) -> u64 {
        self.handle.deadline_nanos()
    }

    pub(crate) fn key(&self) -> Option<i64> {
        self.handle.key()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

#[cfg(test)]
pub(crate) fn test_entry(id: u64, deadline: u64) -> TimerEntry {
    TimerEntry::new(TaskHandle::new(id, None, deadline), Box::new(|_| Ok(())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_and_execute_race_has_one_winner() {
        let handle = TaskHandle::new(1, None, 0);
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!handle.try_execute());
        assert_eq!(handle.state(), TaskState::Cancelled);

        let handle = TaskHandle::new(2, Some(9), 5);
        assert!(handle.try_execute());
        assert!(!handle.cancel());
        assert!(handle.is_executed());
        assert_eq!(handle.key(), Some(9));
        assert_eq!(handle.deadline(), Duration::from_nanos(5));
    }

    #[test]
    fn clones_share_state() {
        let a = TaskHandle::new(3, None, 0);
        let b = a.clone();
        assert!(b.cancel());
        assert!(a.is_cancelled());
    }
}
