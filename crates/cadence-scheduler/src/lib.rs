//! `cadence-scheduler`: local execution engine of the distributed scheduler.
//!
//! # Overview
//!
//! Everything here runs inside one node. Fire times are derived from a
//! [`cadence_core::JobTrigger`] and the database clock; due work is parked on
//! a hashed [`WheelTimer`] and handed to a bounded [`WorkExecutor`] when its
//! tick comes round. [`TaskContext`] keeps the per-node counters the
//! dispatcher consults before and after each run.
//!
//! # Components
//!
//! | Module      | Responsibility                                         |
//! |-------------|--------------------------------------------------------|
//! | `trigger`   | Next fire time, misfire detection and handling          |
//! | `wheel`     | One-shot delayed tasks on a single ticking thread       |
//! | `context`   | Reentry, fire and run counters; next-trigger staging    |
//! | `executor`  | Fixed-size worker pool with a bounded queue             |

pub mod context;
pub mod error;
pub mod executor;
pub mod trigger;
pub mod wheel;

pub use context::TaskContext;
pub use error::{Result, SchedulerError};
pub use executor::{DirectExecutor, Executor, ExecutorConfig, Job, JobFuture, WorkExecutor};
pub use trigger::FireDecision;
pub use wheel::{
    Clock, MonotonicClock, SleepRounding, TaskHandle, TaskState, TimerState, WheelConfig,
    WheelTimer,
};
