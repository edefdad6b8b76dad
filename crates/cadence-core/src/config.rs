use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_DURATION_MS: u64 = 100;
pub const DEFAULT_TICKS_PER_WHEEL: u32 = 512;
pub const MAX_TICKS_PER_WHEEL: u32 = 1 << 30;
// Upper bound on pending tasks moved into buckets per tick, so a flood of
// add_task calls cannot starve bucket expiry.
pub const DEFAULT_MAX_TRANSFER_PER_TICK: usize = 100_000;
pub const DEFAULT_WHEEL_THREAD_NAME: &str = "cadence-wheel";
pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_JOB_THREAD_PREFIX: &str = "cadence-job";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub wheel: WheelSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
}

/// Time-wheel timer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WheelSettings {
    /// Wheel resolution in milliseconds.
    #[serde(default = "default_tick_duration_ms")]
    pub tick_duration_ms: u64,
    /// Bucket count; rounded up to the next power of two.
    #[serde(default = "default_ticks_per_wheel")]
    pub ticks_per_wheel: u32,
    #[serde(default = "default_max_transfer_per_tick")]
    pub max_transfer_per_tick: usize,
    #[serde(default = "default_wheel_thread_name")]
    pub thread_name: String,
}

impl Default for WheelSettings {
    fn default() -> Self {
        Self {
            tick_duration_ms: DEFAULT_TICK_DURATION_MS,
            ticks_per_wheel: DEFAULT_TICKS_PER_WHEEL,
            max_transfer_per_tick: DEFAULT_MAX_TRANSFER_PER_TICK,
            thread_name: DEFAULT_WHEEL_THREAD_NAME.to_string(),
        }
    }
}

/// Job worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Fixed number of worker threads (core size == max size).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Bounded queue length; submissions beyond it are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_job_thread_prefix")]
    pub name_prefix: String,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            name_prefix: DEFAULT_JOB_THREAD_PREFIX.to_string(),
        }
    }
}

fn default_tick_duration_ms() -> u64 {
    DEFAULT_TICK_DURATION_MS
}
fn default_ticks_per_wheel() -> u32 {
    DEFAULT_TICKS_PER_WHEEL
}
fn default_max_transfer_per_tick() -> usize {
    DEFAULT_MAX_TRANSFER_PER_TICK
}
fn default_wheel_thread_name() -> String {
    DEFAULT_WHEEL_THREAD_NAME.to_string()
}
fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_job_thread_prefix() -> String {
    DEFAULT_JOB_THREAD_PREFIX.to_string()
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::CoreError;

        if self.wheel.tick_duration_ms == 0 {
            return Err(CoreError::Config("wheel.tick_duration_ms must be > 0".into()));
        }
        if self.wheel.ticks_per_wheel == 0 || self.wheel.ticks_per_wheel > MAX_TICKS_PER_WHEEL {
            return Err(CoreError::Config(format!(
                "wheel.ticks_per_wheel must be in 1..={MAX_TICKS_PER_WHEEL}"
            )));
        }
        if self.wheel.max_transfer_per_tick == 0 {
            return Err(CoreError::Config("wheel.max_transfer_per_tick must be > 0".into()));
        }
        if self.executor.pool_size == 0 {
            return Err(CoreError::Config("executor.pool_size must be > 0".into()));
        }
        if self.executor.queue_capacity == 0 {
            return Err(CoreError::Config("executor.queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = CadenceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.wheel.tick_duration_ms, 100);
        assert_eq!(config.executor.pool_size, 8);
    }

    #[test]
    fn load_reads_toml_and_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[wheel]\ntick_duration_ms = 50\n\n[executor]\nqueue_capacity = 16\n"
        )
        .unwrap();

        let config = CadenceConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.wheel.tick_duration_ms, 50);
        assert_eq!(config.wheel.ticks_per_wheel, DEFAULT_TICKS_PER_WHEEL);
        assert_eq!(config.executor.queue_capacity, 16);
        assert_eq!(config.executor.name_prefix, "cadence-job");
    }

    #[test]
    fn load_rejects_zero_pool() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[executor]\npool_size = 0\n").unwrap();

        let err = CadenceConfig::load(file.path().to_str()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = CadenceConfig::load(Some("/nonexistent/cadence.toml")).unwrap();
        assert_eq!(config.wheel.thread_name, "cadence-wheel");
    }
}
