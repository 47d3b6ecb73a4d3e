#[cfg(feature = "rt")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One row of the percentile table.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct PercentileValue {
    pub percentile: f64,
    pub latency: Duration,
}

/// Summary of a completed run.
///
/// `achieved_rate` is rounds per second measured over the publisher's lifetime only, so slow
/// subscribers or aggregation do not skew it.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct RunSummary {
    pub subject: String,
    pub achieved_rate: f64,
    pub max_latency: Duration,
    pub total_received: u64,
    pub total_rejected: u64,
    pub percentiles: Vec<PercentileValue>,
    pub histogram_path: PathBuf,
}

impl RunSummary {
    pub fn latency(&self, percentile: f64) -> Option<Duration> {
        self.percentiles
            .iter()
            .find(|p| p.percentile == percentile)
            .map(|p| p.latency)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: rate={:.2}/s, received={}, rejected={}, max={:?}",
            self.subject, self.achieved_rate, self.total_received, self.total_rejected,
            self.max_latency,
        )
    }
}

/// Rounds per second over `elapsed`.
pub fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0. {
        count as f64 / secs
    } else {
        0.
    }
}
