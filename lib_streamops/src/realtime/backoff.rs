use std::time::Duration;

use crate::configs::ClientSettings;

/// Exponential reconnect schedule with a cap and an attempt budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub growth_factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            growth_factor: 1.5,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl From<&ClientSettings> for ReconnectPolicy {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            base_delay: settings.reconnect_base_delay,
            growth_factor: settings.reconnect_growth_factor,
            max_delay: settings.reconnect_max_delay,
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base × growth^attempt, max_delay)`, with `attempt` counted from 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.growth_factor.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            return self.max_delay;
        }
        Duration::from_millis(millis.round() as u64)
    }

    /// Whether another reconnect may be scheduled after `attempts` have
    /// already been used.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u128> = (0..3).map(|a| policy.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![1000, 1500, 2250]);
    }

    #[test]
    fn test_delays_monotone_and_capped() {
        let policy = ReconnectPolicy {
            max_delay: Duration::from_secs(5),
            ..ReconnectPolicy::default()
        };
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(5));
            previous = delay;
        }
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }
}
