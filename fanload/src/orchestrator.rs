//! Run orchestration
//!
//! A [`Run`] wires one publisher to `shard_count` subscribers under a single subject and only
//! aggregates after the publisher and every shard have reported completion. [`Batches`] runs
//! several independent runs side by side, each under its own subject.
use crate::aggregator::LatencyAggregator;
use crate::broker::Broker;
use crate::publisher::Publisher;
use crate::subscriber::SubscriberGroup;
use crate::HarnessError;
use fanload_core::{run_subject, ConfigError, HarnessConfig, RunConfig, RunSummary};
use futures_util::future::join_all;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    /// Publisher and subscribers are both active.
    Running,
    PublishDone,
    AllShardsDone,
    Aggregating,
    Reported,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Reported | RunPhase::Failed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Running => "running",
            RunPhase::PublishDone => "publish done",
            RunPhase::AllShardsDone => "all shards done",
            RunPhase::Aggregating => "aggregating",
            RunPhase::Reported => "reported",
            RunPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub struct Run<B> {
    broker: B,
    subject: String,
    config: RunConfig,
    phase: watch::Sender<RunPhase>,
}

impl<B: Broker> Run<B> {
    pub fn new(broker: B, subject: impl Into<String>, config: RunConfig) -> Self {
        let (phase, _) = watch::channel(RunPhase::Idle);
        Self {
            broker,
            subject: subject.into(),
            config,
            phase,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    pub fn histogram_path(&self) -> PathBuf {
        self.config
            .output_dir
            .join(format!("Durations-{}.histogram", self.subject))
    }

    #[instrument(name = "run", skip_all, fields(subject = %self.subject))]
    pub async fn execute(self) -> Result<RunSummary, HarnessError> {
        let res = self.drive().await;
        match &res {
            Ok(_) => {
                self.phase.send_replace(RunPhase::Reported);
            }
            Err(err) => {
                self.phase.send_replace(RunPhase::Failed);
                error!("Run {} failed: {err}", self.subject);
            }
        }
        res
    }

    async fn drive(&self) -> Result<RunSummary, HarnessError> {
        self.config.validate()?;
        info!("Running {} with config {}", self.subject, self.config);
        let timeout = self.config.effective_timeout();
        let deadline = Instant::now()
            .checked_add(timeout)
            .ok_or(ConfigError::TimeoutTooLong(timeout))?;

        let subscribers = within(
            deadline,
            RunPhase::Idle,
            SubscriberGroup::subscribe(
                &self.broker,
                &self.subject,
                self.config.shard_count,
                self.config.target_count,
            ),
        )
        .await?;

        let mut publisher =
            Publisher::new(self.broker.clone(), &self.subject, &self.config).spawn();
        self.phase.send_replace(RunPhase::Running);

        let published = within(deadline, RunPhase::Running, publisher.finished()).await?;
        self.phase.send_replace(RunPhase::PublishDone);
        info!(
            "##### Received publisher done after {:?} #####",
            published.elapsed
        );

        let reports = within(deadline, RunPhase::PublishDone, subscribers.wait()).await?;
        self.phase.send_replace(RunPhase::AllShardsDone);

        self.phase.send_replace(RunPhase::Aggregating);
        let total_received = reports.iter().map(|r| r.received).sum();
        let total_rejected = reports.iter().map(|r| r.rejected).sum();
        let max_latency = reports
            .iter()
            .map(|r| r.max_latency)
            .max()
            .unwrap_or(Duration::ZERO);
        let samples: Vec<Duration> = reports.into_iter().flat_map(|r| r.samples).collect();

        let distribution = LatencyAggregator::from_config(&self.config).aggregate(&samples)?;
        let histogram_path = self.histogram_path();
        distribution.write_to(&histogram_path).await?;
        debug!("Distribution written to {histogram_path:?}");

        let summary = RunSummary {
            subject: self.subject.clone(),
            achieved_rate: published.achieved_rate(),
            max_latency,
            total_received,
            total_rejected,
            percentiles: distribution.percentiles().to_vec(),
            histogram_path,
        };
        info!(
            "Avg msg rate reached: {:.2}/s, max latency reached: {:?}",
            summary.achieved_rate, summary.max_latency
        );
        Ok(summary)
    }
}

async fn within<T, F>(deadline: Instant, phase: RunPhase, fut: F) -> Result<T, HarnessError>
where
    F: std::future::Future<Output = Result<T, HarnessError>>,
{
    timeout_at(deadline, fut)
        .await
        .map_err(|_| HarnessError::Timeout { phase })?
}

/// Independent runs executed concurrently. Only the broker handle is shared between them.
pub struct Batches<B> {
    runs: Vec<Run<B>>,
}

impl<B: Broker> Batches<B> {
    pub fn new(broker: &B, config: &HarnessConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let runs = (0..config.parallel_batch)
            .map(|_| {
                Run::new(
                    broker.clone(),
                    run_subject(&config.subject_prefix),
                    config.run.clone(),
                )
            })
            .collect();
        Ok(Self { runs })
    }

    pub fn runs(&self) -> &[Run<B>] {
        &self.runs
    }

    /// Results in batch order.
    #[instrument(name = "batches", skip_all, fields(count = self.runs.len()))]
    pub async fn execute(self) -> Vec<Result<RunSummary, HarnessError>> {
        let handles: Vec<_> = self
            .runs
            .into_iter()
            .map(|run| tokio::spawn(run.execute().in_current_span()))
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .map(|res| res.map_err(HarnessError::from).and_then(|res| res))
            .collect()
    }
}

/// Plan and execute `parallel_batch` runs, each under a fresh subject.
pub async fn run_batches<B: Broker>(
    broker: &B,
    config: &HarnessConfig,
) -> Result<Vec<Result<RunSummary, HarnessError>>, HarnessError> {
    Ok(Batches::new(broker, config)?.execute().await)
}
