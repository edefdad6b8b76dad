use cadence_core::TriggerId;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The trigger definition cannot produce fire times. The caller should
    /// mark the trigger as errored rather than resubmit it unchanged.
    #[error("Invalid trigger {id}: {reason}")]
    InvalidTrigger { id: TriggerId, reason: String },

    /// A constructor or call argument is out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Lifecycle misuse, e.g. stopping the timer from one of its own callbacks.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The worker pool queue is full.
    #[error("Execution rejected: {reason}")]
    Rejected { reason: String },

    /// A submitted job panicked or was dropped before producing a result.
    #[error("Job failed: {0}")]
    JobFailed(String),

    /// Spawning a worker thread failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    pub(crate) fn invalid_trigger(id: TriggerId, reason: impl Into<String>) -> Self {
        SchedulerError::InvalidTrigger {
            id,
            reason: reason.into(),
        }
    }

    /// Short error code string for log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidTrigger { .. } => "INVALID_TRIGGER",
            SchedulerError::InvalidArgument(_) => "INVALID_ARGUMENT",
            SchedulerError::IllegalState(_) => "ILLEGAL_STATE",
            SchedulerError::Rejected { .. } => "REJECTED",
            SchedulerError::JobFailed(_) => "JOB_FAILED",
            SchedulerError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
