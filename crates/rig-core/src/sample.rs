use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome class of a single request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Success,
    HttpError,
    TransportError,
    Timeout,
}

impl SampleStatus {
    pub fn is_error(self) -> bool {
        !matches!(self, SampleStatus::Success)
    }

    /// Classification of a received HTTP status code.
    pub fn from_http_status(code: u16) -> Self {
        if code >= 400 {
            SampleStatus::HttpError
        } else {
            SampleStatus::Success
        }
    }
}

/// Immutable record of one request attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub status: SampleStatus,
    pub byte_size: u64,
    pub http_status: Option<u16>,
    pub checks_passed: u32,
    pub checks_failed: u32,
}

impl MetricSample {
    pub fn new(status: SampleStatus, latency: Duration, byte_size: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            latency_ms: latency.as_nanos() as f64 / 1_000_000.0,
            status,
            byte_size,
            http_status: None,
            checks_passed: 0,
            checks_failed: 0,
        }
    }

    pub fn with_http_status(mut self, code: u16) -> Self {
        self.http_status = Some(code);
        self
    }

    pub fn with_checks(mut self, passed: u32, failed: u32) -> Self {
        self.checks_passed = passed;
        self.checks_failed = failed;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(SampleStatus::from_http_status(200), SampleStatus::Success);
        assert_eq!(SampleStatus::from_http_status(302), SampleStatus::Success);
        assert_eq!(SampleStatus::from_http_status(400), SampleStatus::HttpError);
        assert_eq!(SampleStatus::from_http_status(503), SampleStatus::HttpError);
    }

    #[test]
    fn test_sample_latency_in_ms() {
        let sample = MetricSample::new(SampleStatus::Timeout, Duration::from_micros(1_500), 0);
        assert!((sample.latency_ms - 1.5).abs() < 1e-9);
        assert!(sample.is_error());
        assert_eq!(sample.http_status, None);
    }
}
