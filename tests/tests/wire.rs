mod utils;
use utils::*;

use bytes::Bytes;
use fanload::prelude::*;
use std::num::NonZeroU32;
use std::time::Duration;

fn config(dir: &tempfile::TempDir, shards: usize, rounds: u64) -> RunConfig {
    RunConfig::default()
        .shards(shards)
        .rounds(rounds)
        .rate(NonZeroU32::new(100).unwrap())
        .timeout(Duration::from_secs(20))
        .output_dir(dir.path())
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn run_over_nats_reports_every_receipt() {
    let broker = NatsBroker::connect(&broker_url()).await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let summary = Run::new(broker, run_subject("wire"), config(&dir, 4, 50))
        .execute()
        .await
        .unwrap();

    assert_eq!(summary.total_received, 4 * 50);
    assert_eq!(summary.total_rejected, 0);
    assert_eq!(summary.percentiles.len(), 12);
    let values: Vec<Duration> = summary.percentiles.iter().map(|p| p.latency).collect();
    assert!(values.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(summary.latency(100.), Some(summary.max_latency));

    let written = std::fs::read_to_string(&summary.histogram_path).unwrap();
    let rows = written.lines().skip(2).filter(|l| !l.is_empty()).count();
    assert_eq!(rows, 12);
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn malformed_payloads_are_skipped() {
    let url = broker_url();
    let broker = NatsBroker::connect(&url).await.unwrap();
    let intruder = NatsBroker::connect(&url).await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let subject = run_subject("malformed");
    let run = Run::new(broker, subject.clone(), config(&dir, 2, 30));
    let mut phase = run.phase();
    let handle = tokio::spawn(run.execute());

    phase.wait_for(|p| *p == RunPhase::Running).await.unwrap();
    intruder
        .publish(&format!("{subject}-0"), Bytes::from_static(b"bad"))
        .await
        .unwrap();
    intruder.flush().await.unwrap();

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.total_received, 2 * 30);
    assert_eq!(summary.total_rejected, 1);
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn parallel_batches_share_one_connection() {
    let broker = NatsBroker::connect(&broker_url()).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let harness = HarnessConfig {
        parallel_batch: 3,
        subject_prefix: "parallel".to_string(),
        run: config(&dir, 2, 25),
        ..Default::default()
    };

    let results = run_batches(&broker, &harness).await.unwrap();
    assert_eq!(results.len(), 3);

    let mut paths = vec![];
    for res in results {
        let summary = res.unwrap();
        assert_eq!(summary.total_received, 50);
        assert!(summary.subject.starts_with("parallel-"));
        paths.push(summary.histogram_path);
    }
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3);
    assert!(!broker.is_closed());
}

#[tokio::test]
#[ntest::timeout(10_000)]
async fn unreachable_broker_fails_to_connect() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let res = NatsBroker::connect(&format!("nats://{addr}")).await;
    assert!(matches!(res, Err(BrokerError::Connect(_))));
}
