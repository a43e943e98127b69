//! Point-in-time metrics snapshots and the derived health state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::labeled_enum;

/// Resource utilisation of the system under migration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub network_percent: f64,
    pub response_time_ms: f64,
    /// Requests (or operations) per second
    pub throughput: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityMetrics {
    pub uptime_percent: f64,
    pub error_rate_percent: f64,
    pub success_rate_percent: f64,
}

impl Default for AvailabilityMetrics {
    fn default() -> Self {
        Self {
            uptime_percent: 100.0,
            error_rate_percent: 0.0,
            success_rate_percent: 100.0,
        }
    }
}

/// Migration-specific counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationMetrics {
    pub bytes_transferred: u64,
    pub records_migrated: u64,
    pub records_total: u64,
    /// Records per second
    pub throughput_rate: f64,
}

impl MigrationMetrics {
    /// Percentage of records migrated, when a total is known.
    pub fn records_percent(&self) -> Option<f64> {
        if self.records_total == 0 {
            return None;
        }
        Some((self.records_migrated as f64 / self.records_total as f64 * 100.0).min(100.0))
    }
}

/// What a probe reports for one sample. The aggregator stamps it into a `Metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSample {
    pub performance: PerformanceMetrics,
    pub availability: AvailabilityMetrics,
    pub migration: MigrationMetrics,
}

/// A stamped metrics snapshot as held by an Execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub sampled_at: DateTime<Utc>,
    pub performance: PerformanceMetrics,
    pub availability: AvailabilityMetrics,
    pub migration: MigrationMetrics,
}

impl Metrics {
    pub fn from_sample(sample: MetricsSample, sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            performance: sample.performance,
            availability: sample.availability,
            migration: sample.migration,
        }
    }
}

/// Health classification derived from consecutive sample outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

labeled_enum!(HealthState, "health state", {
    Healthy => "healthy",
    Degraded => "degraded",
    Unhealthy => "unhealthy",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_percent() {
        let m = MigrationMetrics {
            records_migrated: 250,
            records_total: 1000,
            ..Default::default()
        };
        assert_eq!(m.records_percent(), Some(25.0));
        assert_eq!(MigrationMetrics::default().records_percent(), None);
    }

    #[test]
    fn test_sample_parses_partial_json() {
        let sample: MetricsSample =
            serde_json::from_str(r#"{"availability":{"error_rate_percent":7.5}}"#).unwrap();
        assert_eq!(sample.availability.error_rate_percent, 7.5);
        assert_eq!(sample.availability.uptime_percent, 100.0);
        assert_eq!(sample.performance.cpu_percent, 0.0);
    }
}
