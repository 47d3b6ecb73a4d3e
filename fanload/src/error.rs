use crate::broker::BrokerError;
use crate::orchestrator::RunPhase;
use fanload_core::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that abort a run. None of them are retried inside the harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Unable to connect to the broker: {0}")]
    Connect(#[source] BrokerError),

    #[error("Unable to subscribe shard {shard}: {source}")]
    Subscribe {
        shard: usize,
        #[source]
        source: BrokerError,
    },

    #[error("Publish to shard {shard} failed: {source}")]
    Publish {
        shard: usize,
        #[source]
        source: BrokerError,
    },

    #[error("Broker flush failed: {0}")]
    Flush(#[source] BrokerError),

    #[error("Subscription for shard {shard} ended after {received} messages")]
    SubscriptionClosed { shard: usize, received: u64 },

    #[error("Run deadline exceeded while {phase}")]
    Timeout { phase: RunPhase },

    #[error("Publisher stopped without reporting completion")]
    PublisherGone,

    #[error("Harness task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("No latency samples were collected")]
    NoSamples,

    #[error("Histogram error: {0}")]
    Histogram(String),

    #[error("Unable to write {path:?}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    /// Whether re-triggering the run may succeed without operator intervention.
    pub fn is_retryable(&self) -> bool {
        use HarnessError::*;
        match self {
            Timeout { .. } | SubscriptionClosed { .. } => true,
            Connect(source) | Publish { source, .. } | Subscribe { source, .. } | Flush(source) => {
                source.is_transport()
            }
            Config(_) | PublisherGone | Join(_) | NoSamples | Histogram(_)
            | Artifact { .. } => false,
        }
    }
}
