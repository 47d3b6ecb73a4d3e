//! Rate-limited publisher
//!
//! Emits `target_count` rounds at `publish_rate` rounds per second. Every round sends one payload
//! to each shard topic and flushes, and runs as its own task so a slow flush does not delay the
//! next tick. The number of rounds in flight is bounded; once the bound is reached the ticker
//! waits for a round to finish instead of piling up tasks.
use crate::broker::Broker;
use crate::HarnessError;
use fanload_core::{encode, rate, shard_subject, unix_nanos, RunConfig};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishReport {
    pub rounds: u64,
    /// From publisher start until the last round was flushed.
    pub elapsed: Duration,
}

impl PublishReport {
    pub fn achieved_rate(&self) -> f64 {
        rate(self.rounds, self.elapsed)
    }
}

pub struct Publisher<B> {
    broker: B,
    subject: String,
    shard_count: usize,
    target_count: u64,
    publish_rate: NonZeroU32,
    payload_size: usize,
    max_in_flight: usize,
}

impl<B: Broker> Publisher<B> {
    pub fn new(broker: B, subject: &str, config: &RunConfig) -> Self {
        Self {
            broker,
            subject: subject.to_string(),
            shard_count: config.shard_count,
            target_count: config.target_count,
            publish_rate: config.publish_rate,
            payload_size: config.payload_size,
            max_in_flight: config.max_in_flight_rounds.max(1),
        }
    }

    /// Start ticking in the background. Completion is reported through the returned handle.
    pub fn spawn(self) -> PublisherHandle {
        let (tx, done) = oneshot::channel();
        let task = tokio::spawn(
            async move {
                let res = self.run().await;
                if let Err(err) = &res {
                    error!("Publisher failed: {err}");
                }
                let _ = tx.send(res);
            }
            .in_current_span(),
        );
        PublisherHandle { done, task }
    }

    #[instrument(name = "publisher", skip_all, fields(subject = %self.subject))]
    async fn run(self) -> Result<PublishReport, HarnessError> {
        info!(
            "Publishing {} rounds to {} shards at {}/s",
            self.target_count, self.shard_count, self.publish_rate
        );

        let limiter = rate_limiter(self.publish_rate);
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let subjects: Arc<[String]> = (0..self.shard_count)
            .map(|shard| shard_subject(&self.subject, shard))
            .collect();

        let start = Instant::now();
        let mut rounds = JoinSet::new();
        let mut published = 0;
        while published < self.target_count {
            tokio::select! {
                biased;

                Some(res) = rounds.join_next(), if !rounds.is_empty() => {
                    res??;
                }

                permit = next_tick(&limiter, &permits) => {
                    let tick = unix_nanos();
                    rounds.spawn(
                        publish_round(
                            self.broker.clone(),
                            subjects.clone(),
                            tick,
                            self.payload_size,
                            permit?,
                        )
                        .in_current_span(),
                    );
                    published += 1;
                }
            }
        }

        while let Some(res) = rounds.join_next().await {
            res??;
        }

        let report = PublishReport {
            rounds: published,
            elapsed: start.elapsed(),
        };
        info!(
            "##### Publisher done: {} rounds in {:?} #####",
            report.rounds, report.elapsed
        );
        Ok(report)
    }
}

/// Waits for a free round slot, then for the next tick.
async fn next_tick(
    limiter: &DefaultDirectRateLimiter,
    permits: &Arc<Semaphore>,
) -> Result<OwnedSemaphorePermit, HarnessError> {
    let permit = permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| HarnessError::PublisherGone)?;
    limiter.until_ready().await;
    Ok(permit)
}

async fn publish_round<B: Broker>(
    broker: B,
    subjects: Arc<[String]>,
    tick: u64,
    payload_size: usize,
    _permit: OwnedSemaphorePermit,
) -> Result<(), HarnessError> {
    let mut rng = SmallRng::from_entropy();
    for (shard, subject) in subjects.iter().enumerate() {
        let payload = encode(tick, payload_size, &mut rng);
        broker
            .publish(subject, payload)
            .await
            .map_err(|source| HarnessError::Publish { shard, source })?;
    }
    broker.flush().await.map_err(HarnessError::Flush)?;

    #[cfg(feature = "metrics")]
    metrics::counter!("fanload_rounds_published").increment(1);

    trace!("Round at {tick} published");
    Ok(())
}

fn rate_limiter(publish_rate: NonZeroU32) -> DefaultDirectRateLimiter {
    RateLimiter::direct(Quota::per_second(publish_rate).allow_burst(NonZeroU32::MIN))
}

/// Handle to a running publisher. Dropping it stops the publisher.
pub struct PublisherHandle {
    done: oneshot::Receiver<Result<PublishReport, HarnessError>>,
    task: JoinHandle<()>,
}

impl PublisherHandle {
    /// Resolves once every round has been published, or on the first failure.
    pub async fn finished(&mut self) -> Result<PublishReport, HarnessError> {
        (&mut self.done)
            .await
            .map_err(|_| HarnessError::PublisherGone)?
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
