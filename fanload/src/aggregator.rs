//! Latency aggregation
//!
//! Samples are recorded into an HDR histogram at microsecond resolution. The percentile table is
//! written in the plain-text layout understood by the HdrHistogram plotter, with values in
//! milliseconds.
use crate::HarnessError;
use fanload_core::{PercentileValue, RunConfig};
use hdrhistogram::Histogram;
use std::fmt::Write;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const HEADER: &str = "Value    Percentile    TotalCount    1/(1-Percentile)\n\n";
const MICROS_PER_MILLI: f64 = 1_000.;
/// Stand-in for `1/(1-q)` at the 100th percentile.
const FULL_PERCENTILE_INVERSE: f64 = 10_000_000.;

#[derive(Debug, Clone)]
pub struct LatencyAggregator {
    significant_figures: u8,
    percentiles: Vec<f64>,
}

impl LatencyAggregator {
    pub fn new(significant_figures: u8, percentiles: &[f64]) -> Self {
        let mut percentiles = percentiles.to_vec();
        percentiles.sort_by(f64::total_cmp);
        percentiles.dedup();
        Self {
            significant_figures,
            percentiles,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.significant_figures, &config.percentiles)
    }

    /// Build the distribution for a finished sample set.
    ///
    /// Pure: the same samples always produce the same distribution.
    pub fn aggregate(&self, samples: &[Duration]) -> Result<Distribution, HarnessError> {
        let mut micros: Vec<u64> = samples.iter().map(|d| d.as_micros() as u64).collect();
        micros.sort_unstable();
        let max = *micros.last().ok_or(HarnessError::NoSamples)?;

        // The histogram needs `high >= 2 * low`.
        let mut histogram =
            Histogram::<u64>::new_with_bounds(1, max.max(2), self.significant_figures)
                .map_err(|err| HarnessError::Histogram(format!("{err:?}")))?;
        for value in &micros {
            histogram
                .record(*value)
                .map_err(|err| HarnessError::Histogram(format!("{err:?}")))?;
        }
        debug!("Aggregated {} samples, max {max}us", histogram.len());

        let percentiles = self
            .percentiles
            .iter()
            .map(|&percentile| {
                // Bucket upper bounds may overshoot the real maximum.
                let value = histogram.value_at_quantile(percentile / 100.).min(max);
                PercentileValue {
                    percentile,
                    latency: Duration::from_micros(value),
                }
            })
            .collect();

        Ok(Distribution {
            histogram,
            percentiles,
            max_latency: Duration::from_micros(max),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Distribution {
    histogram: Histogram<u64>,
    percentiles: Vec<PercentileValue>,
    max_latency: Duration,
}

impl Distribution {
    pub fn percentiles(&self) -> &[PercentileValue] {
        &self.percentiles
    }

    pub fn max_latency(&self) -> Duration {
        self.max_latency
    }

    pub fn total_count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn render(&self) -> String {
        let total = self.total_count() as f64;
        let mut out = String::from(HEADER);
        for PercentileValue {
            percentile,
            latency,
        } in &self.percentiles
        {
            let quantile = percentile / 100.;
            let value = latency.as_micros() as f64 / MICROS_PER_MILLI;
            let count = (quantile * total + 0.5) as u64;
            let inverse = if *percentile < 100. {
                1. / (1. - quantile)
            } else {
                FULL_PERCENTILE_INVERSE
            };
            let _ = writeln!(
                out,
                "{value:.6}    {quantile:.6}        {count}            {inverse:.6}"
            );
        }
        out
    }

    pub async fn write_to(&self, path: &Path) -> Result<(), HarnessError> {
        tokio::fs::write(path, self.render())
            .await
            .map_err(|source| HarnessError::Artifact {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanload_core::DEFAULT_PERCENTILES;

    fn micros(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_micros(*v)).collect()
    }

    fn aggregator() -> LatencyAggregator {
        LatencyAggregator::new(5, &DEFAULT_PERCENTILES)
    }

    #[test]
    fn percentiles_are_monotonic_and_end_at_max() {
        let samples: Vec<Duration> = (1..=10_000u64)
            .map(|i| Duration::from_micros((i * 7919) % 250_000 + 1))
            .collect();
        let distribution = aggregator().aggregate(&samples).unwrap();

        let values: Vec<Duration> = distribution
            .percentiles()
            .iter()
            .map(|p| p.latency)
            .collect();
        assert!(values.windows(2).all(|w| w[0] <= w[1]), "{values:?}");

        let max = *samples.iter().max().unwrap();
        assert_eq!(distribution.max_latency(), max);
        assert_eq!(*values.last().unwrap(), max);
        assert_eq!(distribution.total_count(), 10_000);
    }

    #[test]
    fn median_of_uniform_samples() {
        let samples = micros(&(1..=1_000).collect::<Vec<_>>());
        let distribution = aggregator().aggregate(&samples).unwrap();
        let p50 = distribution
            .percentiles()
            .iter()
            .find(|p| p.percentile == 50.)
            .unwrap();
        assert_eq!(p50.latency, Duration::from_micros(500));
    }

    #[test]
    fn aggregation_is_idempotent() {
        let samples = micros(&[5, 900, 12, 40_000, 7, 7, 310]);
        let a = aggregator().aggregate(&samples).unwrap();
        let b = aggregator().aggregate(&samples).unwrap();
        assert_eq!(a.percentiles(), b.percentiles());
        assert_eq!(a.render(), b.render());
    }

    #[test]
    fn sample_order_does_not_matter() {
        let a = aggregator().aggregate(&micros(&[3, 1, 2, 100])).unwrap();
        let b = aggregator().aggregate(&micros(&[100, 2, 3, 1])).unwrap();
        assert_eq!(a.render(), b.render());
    }

    #[test]
    fn single_tiny_sample() {
        let distribution = aggregator().aggregate(&micros(&[0])).unwrap();
        assert_eq!(distribution.max_latency(), Duration::ZERO);
        assert!(distribution
            .percentiles()
            .iter()
            .all(|p| p.latency == Duration::ZERO));
    }

    #[test]
    fn empty_sample_set_is_an_error() {
        assert!(matches!(
            aggregator().aggregate(&[]),
            Err(HarnessError::NoSamples)
        ));
    }

    #[test]
    fn percentiles_are_sorted() {
        let aggregator = LatencyAggregator::new(3, &[99., 50., 100., 50.]);
        assert_eq!(aggregator.percentiles, vec![50., 99., 100.]);
    }

    #[test]
    fn renders_plotter_table() {
        let aggregator = LatencyAggregator::new(3, &[50., 100.]);
        let distribution = aggregator
            .aggregate(&micros(&[1_000, 2_000, 3_000, 4_000]))
            .unwrap();
        let rendered = distribution.render();
        let mut lines = rendered.lines();

        assert_eq!(
            lines.next(),
            Some("Value    Percentile    TotalCount    1/(1-Percentile)")
        );
        assert_eq!(lines.next(), Some(""));
        assert_eq!(
            lines.next(),
            Some("2.000000    0.500000        2            2.000000")
        );
        assert_eq!(
            lines.next(),
            Some("4.000000    1.000000        4            10000000.000000")
        );
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Durations-test.histogram");
        let distribution = aggregator().aggregate(&micros(&[10, 20, 30])).unwrap();
        distribution.write_to(&path).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, distribution.render());
        assert_eq!(written.lines().count(), 2 + DEFAULT_PERCENTILES.len());
    }

    #[tokio::test]
    async fn unwritable_artifact_is_an_error() {
        let distribution = aggregator().aggregate(&micros(&[10])).unwrap();
        let res = distribution
            .write_to(Path::new("/nonexistent-dir/Durations-x.histogram"))
            .await;
        assert!(matches!(res, Err(HarnessError::Artifact { .. })));
    }
}
