use crate::model::HealthState;

/// Classifies health from consecutive sample outcomes.
///
/// The first failed sample degrades health; `retries` consecutive failures
/// make it unhealthy; any successful sample restores it.
#[derive(Debug, Clone)]
pub struct HealthClassifier {
    retries: u32,
    consecutive_failures: u32,
    state: HealthState,
}

impl HealthClassifier {
    pub fn new(retries: u32) -> Self {
        Self {
            retries: retries.max(1),
            consecutive_failures: 0,
            state: HealthState::Healthy,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record one sample outcome. Returns the new state when it changed.
    pub fn record(&mut self, success: bool) -> Option<HealthState> {
        let next = if success {
            self.consecutive_failures = 0;
            HealthState::Healthy
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= self.retries {
                HealthState::Unhealthy
            } else {
                HealthState::Degraded
            }
        };

        if next == self.state {
            None
        } else {
            self.state = next;
            Some(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unhealthy_only_after_consecutive_failures() {
        let mut c = HealthClassifier::new(3);
        assert_eq!(c.record(false), Some(HealthState::Degraded));
        assert_eq!(c.record(false), None);
        assert_eq!(c.state(), HealthState::Degraded);
        assert_eq!(c.record(false), Some(HealthState::Unhealthy));
        assert_eq!(c.consecutive_failures(), 3);
    }

    #[test]
    fn test_transient_failure_does_not_trip() {
        let mut c = HealthClassifier::new(2);
        c.record(false);
        assert_eq!(c.record(true), Some(HealthState::Healthy));
        c.record(false);
        assert_eq!(c.state(), HealthState::Degraded);
        assert_eq!(c.consecutive_failures(), 1);
    }

    #[test]
    fn test_recovery_from_unhealthy() {
        let mut c = HealthClassifier::new(1);
        assert_eq!(c.record(false), Some(HealthState::Unhealthy));
        assert_eq!(c.record(true), Some(HealthState::Healthy));
        assert_eq!(c.record(true), None);
    }

    #[test]
    fn test_zero_retries_behaves_like_one() {
        let mut c = HealthClassifier::new(0);
        assert_eq!(c.record(false), Some(HealthState::Unhealthy));
    }
}
