//! Periodic health sampling for one Execution.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HealthClassifier, HealthProbe, MetricsStore};
use crate::config::HealthSection;
use crate::errors::HealthCheckFailure;
use crate::executor::duration_ms;
use crate::issues::{Issue, IssueSeverity, IssueTracker, IssueType};
use crate::model::{HealthState, Metrics, MetricsSample};

/// What the aggregator tells the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthSignal {
    Sampled(Metrics),
    SampleFailed {
        failure: HealthCheckFailure,
        consecutive_failures: u32,
    },
    Changed {
        from: HealthState,
        to: HealthState,
    },
    IssueRaised(Issue),
}

/// One configured threshold that a sample crossed.
struct Breach {
    key: &'static str,
    issue_type: IssueType,
    severity: IssueSeverity,
    title: String,
    description: String,
}

fn breaches(sample: &MetricsSample, cfg: &HealthSection) -> Vec<Breach> {
    let mut out = Vec::new();

    if let Some(max) = cfg.max_error_rate
        && sample.availability.error_rate_percent > max
    {
        let rate = sample.availability.error_rate_percent;
        out.push(Breach {
            key: "error_rate",
            issue_type: IssueType::Data,
            severity: if rate > max * 2.0 {
                IssueSeverity::Critical
            } else {
                IssueSeverity::High
            },
            title: "Error rate above threshold".to_string(),
            description: format!("Error rate {:.2}% exceeds {:.2}%", rate, max),
        });
    }
    if let Some(min) = cfg.min_success_rate
        && sample.availability.success_rate_percent < min
    {
        out.push(Breach {
            key: "success_rate",
            issue_type: IssueType::Data,
            severity: IssueSeverity::High,
            title: "Success rate below threshold".to_string(),
            description: format!(
                "Success rate {:.2}% is below {:.2}%",
                sample.availability.success_rate_percent, min
            ),
        });
    }
    if let Some(max) = cfg.max_cpu_percent
        && sample.performance.cpu_percent > max
    {
        out.push(Breach {
            key: "cpu",
            issue_type: IssueType::Performance,
            severity: IssueSeverity::Medium,
            title: "CPU utilisation above threshold".to_string(),
            description: format!(
                "CPU at {:.1}% exceeds {:.1}%",
                sample.performance.cpu_percent, max
            ),
        });
    }
    if let Some(max) = cfg.max_memory_percent
        && sample.performance.memory_percent > max
    {
        out.push(Breach {
            key: "memory",
            issue_type: IssueType::Performance,
            severity: IssueSeverity::Medium,
            title: "Memory utilisation above threshold".to_string(),
            description: format!(
                "Memory at {:.1}% exceeds {:.1}%",
                sample.performance.memory_percent, max
            ),
        });
    }
    if let Some(max) = cfg.max_response_time_ms
        && sample.performance.response_time_ms > max
    {
        out.push(Breach {
            key: "response_time",
            issue_type: IssueType::Performance,
            severity: IssueSeverity::Medium,
            title: "Response time above threshold".to_string(),
            description: format!(
                "Response time {:.0}ms exceeds {:.0}ms",
                sample.performance.response_time_ms, max
            ),
        });
    }

    out
}

/// Samples a probe on an interval, classifies health, and records metrics
/// and issues. It never touches phase or step state.
pub struct HealthAggregator<T> {
    execution_id: Uuid,
    probe: Arc<dyn HealthProbe>,
    config: HealthSection,
    classifier: HealthClassifier,
    metrics: Arc<MetricsStore>,
    issues: Arc<IssueTracker>,
    signals: mpsc::Sender<T>,
    /// Thresholds currently crossed; an issue is raised only on the crossing edge
    active_breaches: HashSet<&'static str>,
}

impl<T> HealthAggregator<T>
where
    T: From<HealthSignal> + Send + 'static,
{
    pub fn new(
        execution_id: Uuid,
        probe: Arc<dyn HealthProbe>,
        config: HealthSection,
        metrics: Arc<MetricsStore>,
        issues: Arc<IssueTracker>,
        signals: mpsc::Sender<T>,
    ) -> Self {
        Self {
            execution_id,
            probe,
            classifier: HealthClassifier::new(config.retries),
            config,
            metrics,
            issues,
            signals,
            active_breaches: HashSet::new(),
        }
    }

    pub fn state(&self) -> HealthState {
        self.classifier.state()
    }

    /// Run until `shutdown` fires or its sender is dropped.
    pub fn spawn(mut self, mut shutdown: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(execution_id = %self.execution_id, "health aggregator started");
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = self.sample_once() => {}
                        }
                    }
                }
            }
            debug!(execution_id = %self.execution_id, "health aggregator stopped");
        })
    }

    /// Take one sample and apply it.
    pub async fn sample_once(&mut self) {
        let outcome = match timeout(self.config.timeout(), self.probe.sample()).await {
            Ok(Ok(sample)) => Ok(sample),
            Ok(Err(err)) => Err(HealthCheckFailure::Probe(format!("{:#}", err))),
            Err(_) => Err(HealthCheckFailure::Timeout {
                timeout_ms: duration_ms(self.config.timeout()),
            }),
        };

        let previous = self.classifier.state();
        let changed = self.classifier.record(outcome.is_ok());

        match outcome {
            Ok(sample) => {
                let found = breaches(&sample, &self.config);
                let metrics = Metrics::from_sample(sample, Utc::now());
                self.metrics.record(metrics.clone());
                self.signal(HealthSignal::Sampled(metrics)).await;
                self.apply_breaches(found).await;
            }
            Err(failure) => {
                let consecutive_failures = self.classifier.consecutive_failures();
                warn!(
                    execution_id = %self.execution_id,
                    consecutive_failures,
                    error = %failure,
                    "health sample failed"
                );
                self.signal(HealthSignal::SampleFailed {
                    failure,
                    consecutive_failures,
                })
                .await;
            }
        }

        if let Some(to) = changed {
            info!(
                execution_id = %self.execution_id,
                from = %previous,
                to = %to,
                "health state changed"
            );
            self.signal(HealthSignal::Changed { from: previous, to }).await;

            if to == HealthState::Unhealthy {
                let issue = Issue::new(
                    IssueSeverity::Critical,
                    IssueType::Connectivity,
                    "System under migration is unhealthy",
                    "health",
                )
                .with_description(format!(
                    "{} consecutive health samples failed",
                    self.classifier.consecutive_failures()
                ))
                .with_impact("Health of the target system cannot be confirmed");
                self.raise(issue).await;
            }
        }
    }

    async fn apply_breaches(&mut self, found: Vec<Breach>) {
        let current: HashSet<&'static str> = found.iter().map(|b| b.key).collect();
        for breach in found {
            if self.active_breaches.contains(breach.key) {
                continue;
            }
            let issue = Issue::new(breach.severity, breach.issue_type, breach.title, "health")
                .with_description(breach.description)
                .with_impact("Threshold crossed while the migration is running");
            self.raise(issue).await;
        }
        self.active_breaches = current;
    }

    async fn raise(&self, issue: Issue) {
        let issue = self.issues.raise(issue);
        warn!(
            execution_id = %self.execution_id,
            severity = %issue.severity,
            title = %issue.title,
            "health issue raised"
        );
        self.signal(HealthSignal::IssueRaised(issue)).await;
    }

    async fn signal(&self, signal: HealthSignal) {
        let _ = self.signals.send(signal.into()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ProbeStep, ScriptedProbe};
    use std::time::Duration;

    fn config() -> HealthSection {
        HealthSection {
            interval_ms: 10,
            timeout_ms: 50,
            retries: 2,
            ..Default::default()
        }
    }

    fn aggregator(
        probe: ScriptedProbe,
        config: HealthSection,
    ) -> (
        HealthAggregator<HealthSignal>,
        mpsc::Receiver<HealthSignal>,
        Arc<IssueTracker>,
        Arc<MetricsStore>,
    ) {
        let (tx, rx) = mpsc::channel(256);
        let issues = Arc::new(IssueTracker::new());
        let metrics = Arc::new(MetricsStore::new(config.history_len));
        let agg = HealthAggregator::new(
            Uuid::nil(),
            Arc::new(probe),
            config,
            metrics.clone(),
            issues.clone(),
            tx,
        );
        (agg, rx, issues, metrics)
    }

    fn drain(rx: &mut mpsc::Receiver<HealthSignal>) -> Vec<HealthSignal> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(signal);
        }
        out
    }

    #[tokio::test]
    async fn test_consecutive_failures_raise_critical_issue() {
        let probe = ScriptedProbe::new(vec![ProbeStep::Fail("refused".into()), ProbeStep::Fail("refused".into())]);
        let (mut agg, mut rx, issues, _) = aggregator(probe, config());

        agg.sample_once().await;
        assert_eq!(agg.state(), HealthState::Degraded);
        assert!(issues.is_empty());

        agg.sample_once().await;
        assert_eq!(agg.state(), HealthState::Unhealthy);
        assert!(issues.has_open_critical());

        let signals = drain(&mut rx);
        assert!(signals.contains(&HealthSignal::Changed {
            from: HealthState::Degraded,
            to: HealthState::Unhealthy
        }));
        assert!(matches!(signals.last(), Some(HealthSignal::IssueRaised(_))));
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let probe = ScriptedProbe::new(vec![
            ProbeStep::Fail("blip".into()),
            ProbeStep::Sample(MetricsSample::default()),
            ProbeStep::Fail("blip".into()),
        ]);
        let (mut agg, _rx, issues, metrics) = aggregator(probe, config());

        for _ in 0..3 {
            agg.sample_once().await;
        }
        assert_eq!(agg.state(), HealthState::Degraded);
        assert!(issues.is_empty());
        assert_eq!(metrics.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_sample() {
        let probe = ScriptedProbe::new(vec![ProbeStep::Hang(Duration::from_secs(5))]);
        let (mut agg, mut rx, _, _) = aggregator(probe, config());

        agg.sample_once().await;
        let signals = drain(&mut rx);
        assert!(matches!(
            signals.first(),
            Some(HealthSignal::SampleFailed {
                failure: HealthCheckFailure::Timeout { timeout_ms: 50 },
                consecutive_failures: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_threshold_issue_is_edge_triggered() {
        let mut hot = MetricsSample::default();
        hot.availability.error_rate_percent = 7.0;
        let probe = ScriptedProbe::new(vec![
            ProbeStep::Sample(hot.clone()),
            ProbeStep::Sample(hot.clone()),
            ProbeStep::Sample(MetricsSample::default()),
            ProbeStep::Sample(hot),
        ]);
        let (mut agg, _rx, issues, metrics) = aggregator(probe, config());

        agg.sample_once().await;
        agg.sample_once().await;
        assert_eq!(issues.len(), 1);
        let issue = &issues.list()[0];
        assert_eq!(issue.issue_type, IssueType::Data);
        assert_eq!(issue.severity, IssueSeverity::High);

        agg.sample_once().await;
        agg.sample_once().await;
        assert_eq!(issues.len(), 2);
        assert_eq!(metrics.len(), 4);
        // threshold breaches are advisory
        assert_eq!(agg.state(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_spawned_task_stops_on_shutdown() {
        let probe = ScriptedProbe::new(vec![ProbeStep::Sample(MetricsSample::default())]);
        let (agg, mut rx, _, metrics) = aggregator(probe, config());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = agg.spawn(shutdown_rx);

        // at least one sample arrives
        let first = rx.recv().await;
        assert!(matches!(first, Some(HealthSignal::Sampled(_))));

        let _ = shutdown_tx.send(());
        handle.await.unwrap();
        assert!(!metrics.is_empty());
    }
}
