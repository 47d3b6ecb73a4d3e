#![doc = include_str!("../README.md")]

pub mod aggregator;
pub mod broker;
pub mod orchestrator;
pub mod publisher;
pub mod subscriber;

mod error;

pub use error::HarnessError;

pub mod prelude {
    pub use crate::aggregator::{Distribution, LatencyAggregator};
    pub use crate::broker::{Broker, BrokerError, LoopbackBroker, NatsBroker};
    pub use crate::orchestrator::{run_batches, Batches, Run, RunPhase};
    pub use crate::HarnessError;
    pub use fanload_core::{run_subject, HarnessConfig, RunConfig, RunSummary};
}
