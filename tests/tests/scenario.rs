mod utils;
#[allow(unused)]
use utils::*;

#[cfg(feature = "integration")]
mod tests {
    use super::*;

    use fanload::prelude::*;
    use std::time::Duration;

    #[tokio::test]
    #[ntest::timeout(200_000)]
    async fn single_shard_profile() {
        let broker = NatsBroker::connect(&broker_url()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::default().output_dir(dir.path());
        let subject = run_subject("loadtest");
        let expected_path = dir.path().join(format!("Durations-{subject}.histogram"));

        let summary = Run::new(broker, subject, config).execute().await.unwrap();

        assert_eq!(summary.total_received, 1000);
        assert!(summary.max_latency < Duration::from_secs(1));
        assert_eq!(summary.histogram_path, expected_path);
        assert!(std::fs::metadata(&expected_path).unwrap().len() > 0);
    }

    /// Ten shards, 1000 rounds at 10 rounds/s, 128 byte payloads: about 100 seconds.
    #[tokio::test]
    #[ntest::timeout(200_000)]
    async fn default_load_profile() {
        let broker = NatsBroker::connect(&broker_url()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::default().shards(10).output_dir(dir.path());
        assert_eq!(config.effective_timeout(), Duration::from_secs(130));

        let summary = Run::new(broker, run_subject("loadtest"), config)
            .execute()
            .await
            .unwrap();

        assert_eq!(summary.total_received, 10_000);
        assert_eq!(summary.total_rejected, 0);
        assert!(
            (9.5..=10.5).contains(&summary.achieved_rate),
            "{}",
            summary.achieved_rate
        );
        assert!(summary.histogram_path.exists());
    }
}
