use std::num::NonZeroU32;
use std::time::Duration;

pub const DEFAULT_PUBLISH_RATE: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(10) };

pub const DEFAULT_TARGET_COUNT: u64 = 1000;

pub const DEFAULT_PAYLOAD_SIZE: usize = 128;

/// Bytes reserved at the head of every payload for the send timestamp.
pub const MIN_PAYLOAD_SIZE: usize = 8;

/// Largest payload a run may publish. Matches the default NATS `max_payload`.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound on `shard_count × target_count` for a single run.
pub const MAX_RUN_MESSAGES: u64 = 100_000_000;

/// Longest deadline a run may be given, explicit or derived.
pub const MAX_RUN_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const DEFAULT_SIGNIFICANT_FIGURES: u8 = 5;

pub const DEFAULT_MAX_IN_FLIGHT_ROUNDS: usize = 16;

/// Slack added on top of the nominal publishing time when no explicit run timeout is set.
pub const DEFAULT_TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// Each shard logs a progress line after this many receipts.
pub const PROGRESS_LOG_INTERVAL: u64 = 300;

pub const DEFAULT_PERCENTILES: [f64; 12] = [
    10., 25., 50., 75., 90., 99., 99.9, 99.99, 99.999, 99.9999, 99.99999, 100.,
];

pub const DEFAULT_OUTPUT_DIR: &str = "/tmp";

pub const DEFAULT_BROKER_ADDRESS: &str = "nats://127.0.0.1:4222";

pub const DEFAULT_SUBJECT_PREFIX: &str = "loadtest";
