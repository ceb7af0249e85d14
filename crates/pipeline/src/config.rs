//! Connection and pipeline tuning.
//!
//! ```
//! use std::time::Duration;
//! use micro_pipeline::config::PipelineConfig;
//!
//! let config = PipelineConfig::builder()
//!     .max_pipeline_depth(4)
//!     .response_timeout(Duration::from_secs(2))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.max_pipeline_depth(), 4);
//! ```

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::ensure;
use crate::protocol::ConfigError;

const DEFAULT_MAX_PIPELINE_DEPTH: usize = 16;
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_WRITE_FAIRNESS_CAP: usize = 8;
const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
const MIN_READ_BUFFER_SIZE: usize = 1024;
const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Settings consumed by one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    max_pipeline_depth: usize,
    response_timeout: Duration,
    body_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    write_fairness_cap: usize,
    read_buffer_size: usize,
    max_body_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pipeline_depth: DEFAULT_MAX_PIPELINE_DEPTH,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            body_timeout: None,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            write_fairness_cap: DEFAULT_WRITE_FAIRNESS_CAP,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder { config: PipelineConfig::default() }
    }

    /// Reads `PIPELINE_*` environment variables on top of the defaults.
    ///
    /// Durations are given in milliseconds; `0` disables an optional timeout.
    ///
    /// | variable                          | field                |
    /// |-----------------------------------|----------------------|
    /// | `PIPELINE_MAX_DEPTH`              | `max_pipeline_depth` |
    /// | `PIPELINE_RESPONSE_TIMEOUT_MS`    | `response_timeout`   |
    /// | `PIPELINE_BODY_TIMEOUT_MS`        | `body_timeout`       |
    /// | `PIPELINE_WRITE_TIMEOUT_MS`       | `write_timeout`      |
    /// | `PIPELINE_IDLE_TIMEOUT_MS`        | `idle_timeout`       |
    /// | `PIPELINE_WRITE_FAIRNESS_CAP`     | `write_fairness_cap` |
    /// | `PIPELINE_READ_BUFFER_SIZE`       | `read_buffer_size`   |
    /// | `PIPELINE_MAX_BODY_SIZE`          | `max_body_size`      |
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::builder();

        if let Some(depth) = env_var::<usize>("PIPELINE_MAX_DEPTH")? {
            builder = builder.max_pipeline_depth(depth);
        }
        if let Some(ms) = env_var::<u64>("PIPELINE_RESPONSE_TIMEOUT_MS")? {
            builder = builder.response_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = env_var::<u64>("PIPELINE_BODY_TIMEOUT_MS")? {
            builder = builder.body_timeout(optional_millis(ms));
        }
        if let Some(ms) = env_var::<u64>("PIPELINE_WRITE_TIMEOUT_MS")? {
            builder = builder.write_timeout(optional_millis(ms));
        }
        if let Some(ms) = env_var::<u64>("PIPELINE_IDLE_TIMEOUT_MS")? {
            builder = builder.idle_timeout(optional_millis(ms));
        }
        if let Some(cap) = env_var::<usize>("PIPELINE_WRITE_FAIRNESS_CAP")? {
            builder = builder.write_fairness_cap(cap);
        }
        if let Some(size) = env_var::<usize>("PIPELINE_READ_BUFFER_SIZE")? {
            builder = builder.read_buffer_size(size);
        }
        if let Some(size) = env_var::<usize>("PIPELINE_MAX_BODY_SIZE")? {
            builder = builder.max_body_size(size);
        }

        builder.build()
    }

    /// Maximum number of live slots before the connection stops reading.
    #[inline]
    pub fn max_pipeline_depth(&self) -> usize {
        self.max_pipeline_depth
    }

    /// Time a handler has to produce a response once its request is parsed.
    #[inline]
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Time between groups of a streamed response; falls back to the response timeout.
    #[inline]
    pub fn body_timeout(&self) -> Option<Duration> {
        self.body_timeout
    }

    /// Time the transport may stay unwritable while a group is draining.
    #[inline]
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Time a connection with nothing in flight is kept open.
    #[inline]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Consecutive groups written before the writer yields to the scheduler.
    #[inline]
    pub fn write_fairness_cap(&self) -> usize {
        self.write_fairness_cap
    }

    #[inline]
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    #[inline]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    #[must_use]
    pub fn max_pipeline_depth(mut self, depth: usize) -> Self {
        self.config.max_pipeline_depth = depth;
        self
    }

    #[must_use]
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    #[must_use]
    pub fn body_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.body_timeout = timeout;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn write_fairness_cap(mut self, cap: usize) -> Self {
        self.config.write_fairness_cap = cap;
        self
    }

    #[must_use]
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let config = self.config;

        ensure!(
            config.max_pipeline_depth >= 1,
            ConfigError::TooSmall { field: "max_pipeline_depth", min: 1, value: config.max_pipeline_depth }
        );
        ensure!(
            config.write_fairness_cap >= 1,
            ConfigError::TooSmall { field: "write_fairness_cap", min: 1, value: config.write_fairness_cap }
        );
        ensure!(
            config.read_buffer_size >= MIN_READ_BUFFER_SIZE,
            ConfigError::TooSmall { field: "read_buffer_size", min: MIN_READ_BUFFER_SIZE, value: config.read_buffer_size }
        );
        ensure!(!config.response_timeout.is_zero(), ConfigError::ZeroDuration { field: "response_timeout" });
        ensure!(!config.body_timeout.is_some_and(|d| d.is_zero()), ConfigError::ZeroDuration { field: "body_timeout" });
        ensure!(!config.write_timeout.is_some_and(|d| d.is_zero()), ConfigError::ZeroDuration { field: "write_timeout" });
        ensure!(!config.idle_timeout.is_some_and(|d| d.is_zero()), ConfigError::ZeroDuration { field: "idle_timeout" });

        Ok(config)
    }
}

fn optional_millis(ms: u64) -> Option<Duration> {
    if ms == 0 { None } else { Some(Duration::from_millis(ms)) }
}

fn env_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match env::var(name) {
        Ok(value) => value.trim().parse::<T>().map(Some).map_err(|e| ConfigError::invalid_env(name, &value, e)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::builder().build().unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.max_pipeline_depth(), 16);
        assert_eq!(config.response_timeout(), Duration::from_secs(10));
        assert_eq!(config.body_timeout(), None);
    }

    #[test]
    fn rejects_zero_depth_and_cap() {
        assert_eq!(
            PipelineConfig::builder().max_pipeline_depth(0).build(),
            Err(ConfigError::TooSmall { field: "max_pipeline_depth", min: 1, value: 0 })
        );
        assert!(PipelineConfig::builder().write_fairness_cap(0).build().is_err());
        assert!(PipelineConfig::builder().read_buffer_size(16).build().is_err());
    }

    #[test]
    fn rejects_zero_durations() {
        assert_eq!(
            PipelineConfig::builder().response_timeout(Duration::ZERO).build(),
            Err(ConfigError::ZeroDuration { field: "response_timeout" })
        );
        assert!(PipelineConfig::builder().idle_timeout(Some(Duration::ZERO)).build().is_err());
        assert!(PipelineConfig::builder().idle_timeout(None).build().is_ok());
    }

    #[test]
    fn optional_millis_maps_zero_to_none() {
        assert_eq!(optional_millis(0), None);
        assert_eq!(optional_millis(1500), Some(Duration::from_millis(1500)));
    }
}
