use crate::sample::{MetricSample, SampleStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Ratio between consecutive bucket boundaries. Percentiles read from the
/// histogram are therefore within 5% of the true order statistic.
const BUCKET_GROWTH: f64 = 1.05;

/// Upper end of the regular buckets; slower samples share one overflow bucket.
pub const HISTOGRAM_CEILING_MS: f64 = 60_000.0;

/// Log-scaled latency histogram with fixed boundaries.
///
/// Bucket 0 holds `[0, 1ms)`, bucket `i` holds `[1.05^(i-1), 1.05^i)` ms, and
/// the last bucket holds everything from the ceiling upward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyHistogram {
    counts: Vec<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            counts: vec![0; Self::overflow_index() + 1],
        }
    }

    fn overflow_index() -> usize {
        (HISTOGRAM_CEILING_MS.ln() / BUCKET_GROWTH.ln()).ceil() as usize + 1
    }

    fn bucket_index(latency_ms: f64) -> usize {
        if latency_ms < 1.0 {
            return 0;
        }
        let idx = (latency_ms.ln() / BUCKET_GROWTH.ln()).floor() as usize + 1;
        idx.min(Self::overflow_index())
    }

    /// Upper boundary of bucket `idx` in milliseconds.
    pub fn upper_bound(idx: usize) -> f64 {
        if idx >= Self::overflow_index() {
            f64::INFINITY
        } else {
            BUCKET_GROWTH.powi(idx as i32)
        }
    }

    pub fn record(&mut self, latency_ms: f64) {
        let idx = Self::bucket_index(latency_ms);
        self.counts[idx] += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Upper boundary of the bucket holding the `p`-th percent sample.
    /// Returns 0 for `p <= 0` or an empty histogram.
    pub fn percentile(&self, p: f64) -> f64 {
        let total = self.total();
        if total == 0 || p <= 0.0 {
            return 0.0;
        }

        let rank = ((p.min(100.0) / 100.0) * total as f64).ceil().max(1.0) as u64;
        let mut cumulative = 0u64;
        for (idx, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= rank {
                return Self::upper_bound(idx);
            }
        }

        Self::upper_bound(self.counts.len() - 1)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Running statistics over every sample of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_requests: u64,
    pub total_errors: u64,
    pub successes: u64,
    pub http_errors: u64,
    pub transport_errors: u64,
    pub timeouts: u64,
    pub bytes_received: u64,
    pub checks_passed: u64,
    pub checks_failed: u64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub sum_latency_ms: f64,
    pub sum_sq_latency_ms: f64,
    pub histogram: LatencyHistogram,
}

impl AggregateStats {
    pub fn new() -> Self {
        Self {
            total_requests: 0,
            total_errors: 0,
            successes: 0,
            http_errors: 0,
            transport_errors: 0,
            timeouts: 0,
            bytes_received: 0,
            checks_passed: 0,
            checks_failed: 0,
            min_latency_ms: 0.0,
            max_latency_ms: 0.0,
            sum_latency_ms: 0.0,
            sum_sq_latency_ms: 0.0,
            histogram: LatencyHistogram::new(),
        }
    }

    pub fn record(&mut self, sample: &MetricSample) {
        let latency = if sample.latency_ms.is_finite() {
            sample.latency_ms.max(0.0)
        } else {
            0.0
        };

        if self.total_requests == 0 {
            self.min_latency_ms = latency;
            self.max_latency_ms = latency;
        } else {
            self.min_latency_ms = self.min_latency_ms.min(latency);
            self.max_latency_ms = self.max_latency_ms.max(latency);
        }

        self.total_requests += 1;
        match sample.status {
            SampleStatus::Success => self.successes += 1,
            SampleStatus::HttpError => self.http_errors += 1,
            SampleStatus::TransportError => self.transport_errors += 1,
            SampleStatus::Timeout => self.timeouts += 1,
        }
        if sample.is_error() {
            self.total_errors += 1;
        }

        self.bytes_received += sample.byte_size;
        self.checks_passed += u64::from(sample.checks_passed);
        self.checks_failed += u64::from(sample.checks_failed);
        self.sum_latency_ms += latency;
        self.sum_sq_latency_ms += latency * latency;
        self.histogram.record(latency);
    }

    /// Fraction of failed requests; 0 when nothing was sent.
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_errors as f64 / self.total_requests as f64
    }

    /// Fraction of passed checks; 0 when no check ran.
    pub fn check_rate(&self) -> f64 {
        let total = self.checks_passed + self.checks_failed;
        if total == 0 {
            return 0.0;
        }
        self.checks_passed as f64 / total as f64
    }

    pub fn mean_latency(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.sum_latency_ms / self.total_requests as f64
    }

    /// Population standard deviation of latency.
    pub fn std_dev_latency(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        let n = self.total_requests as f64;
        let mean = self.sum_latency_ms / n;
        (self.sum_sq_latency_ms / n - mean * mean).max(0.0).sqrt()
    }

    /// Approximate latency percentile (`p` in percent), never above the
    /// observed maximum.
    pub fn percentile(&self, p: f64) -> f64 {
        self.histogram.percentile(p).min(self.max_latency_ms)
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            total_requests: self.total_requests,
            total_errors: self.total_errors,
            error_rate: self.error_rate(),
            successes: self.successes,
            http_errors: self.http_errors,
            transport_errors: self.transport_errors,
            timeouts: self.timeouts,
            bytes_received: self.bytes_received,
            checks_passed: self.checks_passed,
            checks_failed: self.checks_failed,
            latency_min_ms: self.min_latency_ms,
            latency_mean_ms: self.mean_latency(),
            latency_max_ms: self.max_latency_ms,
            latency_std_dev_ms: self.std_dev_latency(),
            latency_p50_ms: self.percentile(50.0),
            latency_p90_ms: self.percentile(90.0),
            latency_p95_ms: self.percentile(95.0),
            latency_p99_ms: self.percentile(99.0),
        }
    }
}

impl Default for AggregateStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub successes: u64,
    pub http_errors: u64,
    pub transport_errors: u64,
    pub timeouts: u64,
    pub bytes_received: u64,
    pub checks_passed: u64,
    pub checks_failed: u64,
    pub latency_min_ms: f64,
    pub latency_mean_ms: f64,
    pub latency_max_ms: f64,
    pub latency_std_dev_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
}

/// Shared sink folding samples into [`AggregateStats`].
///
/// Clones share the same statistics. The lock only ever guards the in-memory
/// fold, so recording never waits on network I/O and a snapshot never sees
/// half of a sample.
#[derive(Debug, Clone, Default)]
pub struct MetricAggregator {
    inner: Arc<Mutex<AggregateStats>>,
}

impl MetricAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: &MetricSample) {
        self.inner.lock().record(sample);
    }

    pub fn snapshot(&self) -> AggregateStats {
        self.inner.lock().clone()
    }

    pub fn total_requests(&self) -> u64 {
        self.inner.lock().total_requests
    }

    /// Drain `samples` until every sender is dropped. Returns how many
    /// samples were folded.
    pub async fn collect(self, mut samples: mpsc::Receiver<MetricSample>) -> u64 {
        let mut folded = 0u64;
        while let Some(sample) = samples.recv().await {
            self.record(&sample);
            folded += 1;
        }
        debug!("Sample channel closed after {} samples", folded);
        folded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(status: SampleStatus, latency_ms: u64) -> MetricSample {
        MetricSample::new(status, Duration::from_millis(latency_ms), 128)
    }

    #[test]
    fn test_stats_basic() {
        let mut stats = AggregateStats::new();
        stats.record(&sample(SampleStatus::Success, 10));
        stats.record(&sample(SampleStatus::HttpError, 30));
        stats.record(&sample(SampleStatus::Timeout, 20));
        stats.record(&sample(SampleStatus::TransportError, 0));

        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.http_errors, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.transport_errors, 1);
        assert_eq!(stats.bytes_received, 512);
        assert_eq!(stats.min_latency_ms, 0.0);
        assert_eq!(stats.max_latency_ms, 30.0);
        assert!((stats.mean_latency() - 15.0).abs() < 1e-9);
        assert!((stats.error_rate() - 0.75).abs() < 1e-9);
        assert_eq!(stats.histogram.total(), stats.total_requests);
    }

    #[test]
    fn test_std_dev() {
        let mut stats = AggregateStats::new();
        for latency in [2, 4, 4, 4, 5, 5, 7, 9] {
            stats.record(&sample(SampleStatus::Success, latency));
        }
        assert!((stats.std_dev_latency() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_calculation() {
        let mut stats = AggregateStats::new();

        for _ in 0..50 {
            stats.record(&sample(SampleStatus::Success, 10));
        }
        for _ in 0..30 {
            stats.record(&sample(SampleStatus::Success, 20));
        }
        for _ in 0..20 {
            stats.record(&sample(SampleStatus::Success, 50));
        }

        let p50 = stats.percentile(50.0);
        let p80 = stats.percentile(80.0);
        let p95 = stats.percentile(95.0);

        assert!((10.0..=10.5).contains(&p50), "p50 should be ~10ms, got {}", p50);
        assert!((20.0..=21.0).contains(&p80), "p80 should be ~20ms, got {}", p80);
        assert!((49.0..=50.0).contains(&p95), "p95 should be ~50ms, got {}", p95);
        assert_eq!(stats.percentile(100.0), 50.0);
    }

    #[test]
    fn test_percentile_empty_and_zero() {
        let stats = AggregateStats::new();
        assert_eq!(stats.percentile(95.0), 0.0);
        assert_eq!(stats.error_rate(), 0.0);
        assert_eq!(stats.mean_latency(), 0.0);

        let mut stats = AggregateStats::new();
        stats.record(&sample(SampleStatus::Success, 40));
        assert_eq!(stats.percentile(0.0), 0.0);
    }

    #[test]
    fn test_histogram_buckets() {
        let mut hist = LatencyHistogram::new();
        hist.record(0.2);
        hist.record(1.0);
        hist.record(HISTOGRAM_CEILING_MS * 10.0);

        let counts = hist.counts();
        assert_eq!(counts[0], 1);
        assert_eq!(counts[counts.len() - 1], 1);
        assert_eq!(hist.total(), 3);
        assert_eq!(LatencyHistogram::upper_bound(0), 1.0);
        assert!(LatencyHistogram::upper_bound(counts.len() - 2) >= HISTOGRAM_CEILING_MS);

        for latency in [3.0, 47.5, 300.0, 12_345.0] {
            let idx = LatencyHistogram::bucket_index(latency);
            assert!(LatencyHistogram::upper_bound(idx) > latency);
            assert!(LatencyHistogram::upper_bound(idx) <= latency * BUCKET_GROWTH * 1.0001);
        }
    }

    #[test]
    fn test_overflow_percentile_clamped_to_max() {
        let mut stats = AggregateStats::new();
        stats.record(&sample(SampleStatus::Timeout, 90_000));
        assert_eq!(stats.percentile(99.0), 90_000.0);
    }

    #[test]
    fn test_concurrent_record_keeps_invariant() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: u64 = 5_000;

        let aggregator = MetricAggregator::new();
        std::thread::scope(|scope| {
            for producer in 0..PRODUCERS {
                let aggregator = aggregator.clone();
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let status = if i % 10 == 0 {
                            SampleStatus::HttpError
                        } else {
                            SampleStatus::Success
                        };
                        aggregator.record(&sample(status, (i + producer as u64) % 400));
                    }
                });
            }

            let reader = aggregator.clone();
            scope.spawn(move || {
                for _ in 0..200 {
                    let snap = reader.snapshot();
                    assert_eq!(snap.histogram.total(), snap.total_requests);
                    assert!(snap.total_errors <= snap.total_requests);
                }
            });
        });

        let snap = aggregator.snapshot();
        assert_eq!(snap.total_requests, PRODUCERS as u64 * PER_PRODUCER);
        assert_eq!(snap.histogram.total(), snap.total_requests);
        assert_eq!(snap.total_errors, PRODUCERS as u64 * PER_PRODUCER / 10);
    }

    #[tokio::test]
    async fn test_collect_drains_channel() {
        let aggregator = MetricAggregator::new();
        let (tx, rx) = mpsc::channel(4);
        let collector = tokio::spawn(aggregator.clone().collect(rx));

        for _ in 0..100 {
            tx.send(sample(SampleStatus::Success, 5)).await.unwrap();
        }
        drop(tx);

        assert_eq!(collector.await.unwrap(), 100);
        assert_eq!(aggregator.total_requests(), 100);
    }
}
