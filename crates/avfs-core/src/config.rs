//! Engine configuration.

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Lowest job priority.
pub const PRIORITY_MIN: i32 = -10;
/// Highest job priority.
pub const PRIORITY_MAX: i32 = 10;
/// Priority used when none is given.
pub const PRIORITY_DEFAULT: i32 = 0;

/// Configuration for a job engine instance.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Maximum number of jobs executing at once.
    #[builder(default = "10")]
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Bound of the worker-to-caller notification queue.
    #[builder(default = "100")]
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Chunk size for transfer reads and writes.
    #[builder(default = "64 * 1024")]
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Minimum spacing between byte-progress snapshots within one file.
    #[builder(default = "Duration::from_millis(100)")]
    #[serde(default = "default_progress_interval", with = "duration_ms")]
    pub progress_interval: Duration,

    /// Priority used by helpers that do not take one.
    #[builder(default = "PRIORITY_DEFAULT")]
    #[serde(default)]
    pub default_priority: i32,
}

fn default_max_workers() -> usize {
    10
}

fn default_channel_capacity() -> usize {
    100
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(100)
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        check_limits(
            self.max_workers,
            self.channel_capacity,
            self.buffer_size,
            self.default_priority,
        )
    }
}

fn check_limits(
    max_workers: Option<usize>,
    channel_capacity: Option<usize>,
    buffer_size: Option<usize>,
    default_priority: Option<i32>,
) -> Result<(), String> {
    if max_workers == Some(0) {
        return Err("max_workers must be at least 1".to_string());
    }
    if channel_capacity == Some(0) {
        return Err("channel_capacity must be at least 1".to_string());
    }
    if buffer_size == Some(0) {
        return Err("buffer_size must be at least 1".to_string());
    }
    if let Some(priority) = default_priority {
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
            return Err(format!(
                "default_priority must be within {PRIORITY_MIN}..={PRIORITY_MAX}"
            ));
        }
    }
    Ok(())
}

impl EngineConfig {
    /// Create a new config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Check invariants of a config that did not come from the builder.
    pub fn validate(&self) -> Result<(), String> {
        check_limits(
            Some(self.max_workers),
            Some(self.channel_capacity),
            Some(self.buffer_size),
            Some(self.default_priority),
        )
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            channel_capacity: default_channel_capacity(),
            buffer_size: default_buffer_size(),
            progress_interval: default_progress_interval(),
            default_priority: PRIORITY_DEFAULT,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::builder()
            .max_workers(2usize)
            .buffer_size(16usize)
            .build()
            .unwrap();

        assert_eq!(config.max_workers, 2);
        assert_eq!(config.buffer_size, 16);
        assert_eq!(config.channel_capacity, 100);
        assert_eq!(config.progress_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_config_rejects_zero_workers() {
        assert!(EngineConfig::builder().max_workers(0usize).build().is_err());
        assert!(EngineConfig::builder().buffer_size(0usize).build().is_err());
        assert!(EngineConfig::builder().default_priority(11).build().is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_workers": 3}"#).unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.buffer_size, 64 * 1024);
        assert!(config.validate().is_ok());

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["progress_interval"], 100);
    }
}
