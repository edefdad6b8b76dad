//! `cadence-core`: types, configuration and errors shared by the scheduler crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{CoreError, Result};
pub use types::{JobId, JobTrigger, MisfireStrategy, TriggerId, TriggerType};
