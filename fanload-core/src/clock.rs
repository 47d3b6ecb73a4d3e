use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Wall clock as nanoseconds since the UNIX epoch.
///
/// Publishers and subscribers both read this clock, so latency is only meaningful when they
/// run on the same host or on hosts with synchronised clocks.
pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A fresh subject for one run. Shard topics are derived from it with [`shard_subject`].
pub fn run_subject(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

pub fn shard_subject(subject: &str, shard: usize) -> String {
    format!("{subject}-{shard}")
}
