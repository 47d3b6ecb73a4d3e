//! Subscriber group
//!
//! One task per shard. Each task is the only owner of its shard's receipt counter and sample
//! buffer, and hands both over in a [`ShardReport`] when the shard reaches its target. Samples
//! are therefore merged exactly once, after every shard is done.
use crate::broker::{Broker, Subscription};
use crate::HarnessError;
use fanload_core::{
    decode_timestamp, latency_since, shard_subject, unix_nanos, PROGRESS_LOG_INTERVAL,
};
use std::time::Duration;
use tokio::task::JoinSet;
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

/// Samples reserved up front per shard. Larger targets grow the buffer as receipts arrive.
const PREALLOCATED_SAMPLES: u64 = 65_536;

#[derive(Debug, Clone, PartialEq)]
pub struct ShardReport {
    pub shard: usize,
    pub received: u64,
    pub rejected: u64,
    pub samples: Vec<Duration>,
    pub max_latency: Duration,
}

pub struct SubscriberGroup {
    subject: String,
    shard_count: usize,
    tasks: JoinSet<Result<ShardReport, HarnessError>>,
}

impl SubscriberGroup {
    /// Attach a receiver to every shard of `subject`.
    ///
    /// The broker is flushed before returning, so every subscription is live before the first
    /// round can be published.
    #[instrument(name = "subscribers", skip_all, fields(subject = subject))]
    pub async fn subscribe<B: Broker>(
        broker: &B,
        subject: &str,
        shard_count: usize,
        target_count: u64,
    ) -> Result<Self, HarnessError> {
        let mut subscriptions = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let subscription = broker
                .subscribe(&shard_subject(subject, shard))
                .await
                .map_err(|source| HarnessError::Subscribe { shard, source })?;
            subscriptions.push(subscription);
        }
        broker.flush().await.map_err(HarnessError::Flush)?;

        let mut tasks = JoinSet::new();
        for (shard, subscription) in subscriptions.into_iter().enumerate() {
            let receiver = ShardReceiver::new(shard, target_count, subscription);
            tasks.spawn(receiver.run().in_current_span());
        }
        debug!("{shard_count} shards subscribed");

        Ok(Self {
            subject: subject.to_string(),
            shard_count,
            tasks,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Resolves once every shard has reached its target, with reports ordered by shard.
    ///
    /// Fails on the first shard that cannot complete; the remaining shards are stopped.
    pub async fn wait(mut self) -> Result<Vec<ShardReport>, HarnessError> {
        let mut reports = Vec::with_capacity(self.shard_count);
        while let Some(res) = self.tasks.join_next().await {
            reports.push(res??);
        }
        reports.sort_by_key(|report| report.shard);
        info!("All {} shards complete", reports.len());
        Ok(reports)
    }
}

struct ShardReceiver {
    shard: usize,
    target: u64,
    subscription: Subscription,
    received: u64,
    rejected: u64,
    samples: Vec<Duration>,
    max_latency: Duration,
}

impl ShardReceiver {
    fn new(shard: usize, target: u64, subscription: Subscription) -> Self {
        Self {
            shard,
            target,
            subscription,
            received: 0,
            rejected: 0,
            samples: Vec::with_capacity(target.min(PREALLOCATED_SAMPLES) as usize),
            max_latency: Duration::ZERO,
        }
    }

    #[instrument(name = "shard", skip_all, fields(shard = self.shard))]
    async fn run(mut self) -> Result<ShardReport, HarnessError> {
        while self.received < self.target {
            let Some(payload) = self.subscription.next().await else {
                error!(
                    "Subscription {} closed after {} messages",
                    self.subscription.subject(),
                    self.received
                );
                return Err(HarnessError::SubscriptionClosed {
                    shard: self.shard,
                    received: self.received,
                });
            };
            self.record(&payload, unix_nanos());
        }

        info!(
            "##### Shard done: {} ({} received, {} rejected) #####",
            self.subscription.subject(),
            self.received,
            self.rejected
        );
        Ok(ShardReport {
            shard: self.shard,
            received: self.received,
            rejected: self.rejected,
            samples: self.samples,
            max_latency: self.max_latency,
        })
    }

    fn record(&mut self, payload: &[u8], received_at: u64) {
        let decoded = decode_timestamp(payload).and_then(|sent| latency_since(sent, received_at));
        let latency = match decoded {
            Ok(latency) => latency,
            Err(err) => {
                self.rejected += 1;
                warn!("Rejected message on {}: {err}", self.subscription.subject());

                #[cfg(feature = "metrics")]
                metrics::counter!("fanload_messages_rejected").increment(1);
                return;
            }
        };

        self.samples.push(latency);
        self.max_latency = self.max_latency.max(latency);
        self.received += 1;

        #[cfg(feature = "metrics")]
        {
            metrics::counter!("fanload_messages_received").increment(1);
            metrics::histogram!("fanload_latency_us").record(latency.as_micros() as f64);
        }

        if self.received % PROGRESS_LOG_INTERVAL == 0 {
            info!(
                "Received {} messages on {}",
                self.received,
                self.subscription.subject()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LoopbackBroker;
    use bytes::Bytes;
    use fanload_core::encode;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    async fn publish_valid(broker: &LoopbackBroker, subject: &str, count: usize) {
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..count {
            let payload = encode(unix_nanos(), 32, &mut rng);
            broker.publish(subject, payload).await.unwrap();
        }
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    #[ntest::timeout(5_000)]
    async fn every_shard_reaches_target() {
        let broker = LoopbackBroker::new();
        let group = SubscriberGroup::subscribe(&broker, "grp", 3, 10)
            .await
            .unwrap();
        for shard in 0..3 {
            publish_valid(&broker, &format!("grp-{shard}"), 10).await;
        }

        let reports = group.wait().await.unwrap();
        assert_eq!(reports.len(), 3);
        let total: u64 = reports.iter().map(|r| r.received).sum();
        assert_eq!(total, 30);
        for (shard, report) in reports.iter().enumerate() {
            assert_eq!(report.shard, shard);
            assert_eq!(report.samples.len(), 10);
            assert_eq!(report.max_latency, *report.samples.iter().max().unwrap());
        }
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    #[ntest::timeout(5_000)]
    async fn malformed_payload_is_skipped() {
        let broker = LoopbackBroker::new();
        let group = SubscriberGroup::subscribe(&broker, "bad", 2, 5).await.unwrap();

        broker
            .publish("bad-0", Bytes::from_static(&[1, 2, 3]))
            .await
            .unwrap();
        publish_valid(&broker, "bad-0", 5).await;
        publish_valid(&broker, "bad-1", 5).await;

        let reports = group.wait().await.unwrap();
        assert_eq!(reports[0].received, 5);
        assert_eq!(reports[0].rejected, 1);
        assert_eq!(reports[1].received, 5);
        assert_eq!(reports[1].rejected, 0);
        assert!(logs_contain("Rejected message on bad-0"));
    }

    #[tokio::test]
    #[ntest::timeout(5_000)]
    async fn future_timestamp_is_rejected() {
        let broker = LoopbackBroker::new();
        let group = SubscriberGroup::subscribe(&broker, "skew", 1, 1).await.unwrap();

        let mut rng = SmallRng::seed_from_u64(1);
        let ahead = unix_nanos() + 3_600_000_000_000;
        broker.publish("skew-0", encode(ahead, 16, &mut rng)).await.unwrap();
        publish_valid(&broker, "skew-0", 1).await;

        let reports = group.wait().await.unwrap();
        assert_eq!(reports[0].received, 1);
        assert_eq!(reports[0].rejected, 1);
    }

    #[tokio::test]
    #[ntest::timeout(5_000)]
    async fn extra_messages_do_not_count() {
        let broker = LoopbackBroker::new();
        let group = SubscriberGroup::subscribe(&broker, "extra", 1, 4).await.unwrap();
        publish_valid(&broker, "extra-0", 9).await;

        let reports = group.wait().await.unwrap();
        assert_eq!(reports[0].received, 4);
        assert_eq!(reports[0].samples.len(), 4);
    }

    #[tokio::test]
    #[ntest::timeout(5_000)]
    async fn record_counts_progress() {
        let broker = LoopbackBroker::new();
        let subscription = broker.subscribe("rec-0").await.unwrap();
        let mut receiver = ShardReceiver::new(0, 10, subscription);

        let mut rng = SmallRng::seed_from_u64(1);
        let payload = encode(1_000, 16, &mut rng);
        receiver.record(&payload, 1_000 + 1_500_000);
        receiver.record(&[0xff; 4], 2_000_000);

        assert_eq!(receiver.received, 1);
        assert_eq!(receiver.rejected, 1);
        assert_eq!(receiver.samples, vec![Duration::from_micros(1_500)]);
        assert_eq!(receiver.max_latency, Duration::from_micros(1_500));
    }

    #[tokio::test]
    async fn huge_target_does_not_reserve_up_front() {
        let broker = LoopbackBroker::new();
        let subscription = broker.subscribe("big-0").await.unwrap();
        let receiver = ShardReceiver::new(0, 1 << 40, subscription);
        assert!(receiver.samples.capacity() < 1 << 20);

        let subscription = broker.subscribe("small-0").await.unwrap();
        let receiver = ShardReceiver::new(0, 10, subscription);
        assert!(receiver.samples.capacity() >= 10);
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    #[ntest::timeout(5_000)]
    async fn progress_is_logged_every_interval() {
        let broker = LoopbackBroker::new();
        let group = SubscriberGroup::subscribe(&broker, "progress", 1, 600)
            .await
            .unwrap();
        publish_valid(&broker, "progress-0", 600).await;

        let reports = group.wait().await.unwrap();
        assert_eq!(reports[0].received, 600);
        assert!(logs_contain("Received 300 messages on progress-0"));
        assert!(logs_contain("Received 600 messages on progress-0"));
        assert!(!logs_contain("Received 299 messages"));
    }
}
