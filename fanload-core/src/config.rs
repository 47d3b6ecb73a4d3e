use crate::{
    DEFAULT_BROKER_ADDRESS, DEFAULT_MAX_IN_FLIGHT_ROUNDS, DEFAULT_OUTPUT_DIR,
    DEFAULT_PAYLOAD_SIZE, DEFAULT_PERCENTILES, DEFAULT_PUBLISH_RATE, DEFAULT_SIGNIFICANT_FIGURES,
    DEFAULT_SUBJECT_PREFIX, DEFAULT_TARGET_COUNT, DEFAULT_TIMEOUT_GRACE, MAX_PAYLOAD_SIZE,
    MAX_RUN_MESSAGES, MAX_RUN_TIMEOUT, MIN_PAYLOAD_SIZE,
};
#[cfg(feature = "rt")]
use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
#[cfg(feature = "rt")]
use serde_with::{serde_as, DurationSeconds};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Shard count must be at least 1")]
    NoShards,

    #[error("Target count must be at least 1")]
    NoRounds,

    #[error("Parallel batch must be at least 1")]
    NoBatches,

    #[error("Payload size {0} cannot hold the 8 byte timestamp")]
    PayloadTooSmall(usize),

    #[error("Payload size {0} exceeds the 64 MiB limit")]
    PayloadTooLarge(usize),

    #[error("{shards} shards × {rounds} rounds exceeds the 100000000 message limit")]
    TooManyMessages { shards: usize, rounds: u64 },

    #[error("Run timeout {} exceeds the 7 day limit", humantime::format_duration(*.0))]
    TimeoutTooLong(Duration),

    #[error("Significant figures must be within 1..=5, got {0}")]
    SignificantFigures(u8),

    #[error("Percentile {0} is outside (0, 100]")]
    Percentile(f64),

    #[error("At least one round must be allowed in flight")]
    NoInFlight,
}

/// Parameters of a single run: one publisher fanning out to `shard_count` subscribers.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "rt", cfg_eval::cfg_eval, serde_as)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize), serde(default))]
pub struct RunConfig {
    pub shard_count: usize,
    /// Number of rounds. Each round delivers one message to every shard, so a shard completes
    /// after receiving `target_count` messages.
    pub target_count: u64,
    /// Rounds per second.
    pub publish_rate: NonZeroU32,
    pub payload_size: usize,
    pub significant_figures: u8,
    pub percentiles: Vec<f64>,
    pub max_in_flight_rounds: usize,
    #[cfg_attr(feature = "rt", serde_as(as = "Option<DurationSeconds>"))]
    pub timeout: Option<Duration>,
    pub output_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            shard_count: 1,
            target_count: DEFAULT_TARGET_COUNT,
            publish_rate: DEFAULT_PUBLISH_RATE,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            significant_figures: DEFAULT_SIGNIFICANT_FIGURES,
            percentiles: DEFAULT_PERCENTILES.to_vec(),
            max_in_flight_rounds: DEFAULT_MAX_IN_FLIGHT_ROUNDS,
            timeout: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl RunConfig {
    pub fn shards(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn rounds(mut self, target_count: u64) -> Self {
        self.target_count = target_count;
        self
    }

    pub fn rate(mut self, publish_rate: NonZeroU32) -> Self {
        self.publish_rate = publish_rate;
        self
    }

    pub fn payload_size(mut self, payload_size: usize) -> Self {
        self.payload_size = payload_size;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Nominal time needed to publish every round at the configured rate. Saturates at
    /// `Duration::MAX`.
    pub fn publishing_time(&self) -> Duration {
        let secs = self.target_count as f64 / self.publish_rate.get() as f64;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Deadline for the whole run, measured from the moment the run starts.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .unwrap_or_else(|| self.publishing_time().saturating_add(DEFAULT_TIMEOUT_GRACE))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 {
            return Err(ConfigError::NoShards);
        }
        if self.target_count == 0 {
            return Err(ConfigError::NoRounds);
        }
        if self.payload_size < MIN_PAYLOAD_SIZE {
            return Err(ConfigError::PayloadTooSmall(self.payload_size));
        }
        if self.payload_size > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::PayloadTooLarge(self.payload_size));
        }
        let messages = (self.shard_count as u64).checked_mul(self.target_count);
        if !matches!(messages, Some(m) if m <= MAX_RUN_MESSAGES) {
            return Err(ConfigError::TooManyMessages {
                shards: self.shard_count,
                rounds: self.target_count,
            });
        }
        let timeout = self.effective_timeout();
        if timeout > MAX_RUN_TIMEOUT {
            return Err(ConfigError::TimeoutTooLong(timeout));
        }
        if !(1..=5).contains(&self.significant_figures) {
            return Err(ConfigError::SignificantFigures(self.significant_figures));
        }
        if let Some(p) = self
            .percentiles
            .iter()
            .find(|p| !(**p > 0. && **p <= 100.))
        {
            return Err(ConfigError::Percentile(*p));
        }
        if self.max_in_flight_rounds == 0 {
            return Err(ConfigError::NoInFlight);
        }
        Ok(())
    }
}

impl std::fmt::Display for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "shards={}, rounds={}, rate={}/s, payload={}B, timeout={}",
            self.shard_count,
            self.target_count,
            self.publish_rate,
            self.payload_size,
            humantime::format_duration(self.effective_timeout()),
        )
    }
}

/// Process-wide configuration, built once at start-up and passed down explicitly.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    pub parallel_batch: usize,
    pub broker_address: String,
    pub subject_prefix: String,
    pub run: RunConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            parallel_batch: 1,
            broker_address: DEFAULT_BROKER_ADDRESS.to_string(),
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            run: RunConfig::default(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel_batch == 0 {
            return Err(ConfigError::NoBatches);
        }
        self.run.validate()
    }
}
