use crate::config::ReconnectConfig;

/// Outcome of a lost connection: wait and try again, or stop for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAfter(u64),
    GiveUp,
}

/// Exponential backoff with a hard attempt budget. The budget counts every
/// connection attempt, the initial connect included, so `max_retries = 3`
/// means three failed dials end the session.
///
/// Pure state machine; the caller supplies the jitter roll so behavior
/// stays deterministic under test.
#[derive(Debug, Clone)]
pub struct Reconnector {
    config: ReconnectConfig,
    attempts: u32,
}

impl Reconnector {
    pub fn new(mut config: ReconnectConfig) -> Self {
        config.sanitize();
        Self {
            config,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records that a dial is starting and returns its ordinal.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// A broker CONNACK arrived; the budget starts over.
    pub fn connected(&mut self) {
        self.attempts = 0;
    }

    /// A fresh login also starts the budget over, even after a terminal
    /// failure.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Decides what to do after the current attempt failed. `jitter_roll`
    /// is a uniform sample in `[0, 1)`.
    pub fn connection_lost(&self, jitter_roll: f64) -> ReconnectDecision {
        if self.attempts >= self.config.max_retries {
            return ReconnectDecision::GiveUp;
        }
        let exponent = self.attempts.min(i32::MAX as u32) as i32;
        let raw = self.config.base_interval_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = raw.min(self.config.max_interval_ms as f64);
        let jittered = capped * (1.0 + jitter_roll.clamp(0.0, 1.0) * self.config.jitter);
        ReconnectDecision::RetryAfter(jittered.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Reconnector {
        Reconnector::new(ReconnectConfig::default())
    }

    #[test]
    fn first_failure_backs_off_from_the_base_interval() {
        let mut reconnector = machine();
        reconnector.begin_attempt();

        assert_eq!(
            reconnector.connection_lost(0.0),
            ReconnectDecision::RetryAfter(1_500)
        );
    }

    #[test]
    fn delays_grow_monotonically_until_the_cap() {
        let config = ReconnectConfig {
            max_retries: 20,
            ..ReconnectConfig::default()
        };
        let mut reconnector = Reconnector::new(config);

        let mut delays = Vec::new();
        for _ in 0..12 {
            reconnector.begin_attempt();
            match reconnector.connection_lost(0.0) {
                ReconnectDecision::RetryAfter(ms) => delays.push(ms),
                ReconnectDecision::GiveUp => panic!("budget should not be exhausted"),
            }
        }

        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0], "delays must never shrink: {delays:?}");
        }
        assert_eq!(*delays.last().unwrap(), 30_000);
    }

    #[test]
    fn jitter_stretches_the_delay_by_at_most_its_factor() {
        let mut reconnector = machine();
        reconnector.begin_attempt();

        assert_eq!(
            reconnector.connection_lost(1.0),
            ReconnectDecision::RetryAfter(1_650)
        );
    }

    #[test]
    fn gives_up_after_the_third_failed_attempt() {
        let mut reconnector = machine();

        reconnector.begin_attempt();
        assert!(matches!(
            reconnector.connection_lost(0.0),
            ReconnectDecision::RetryAfter(_)
        ));

        reconnector.begin_attempt();
        assert!(matches!(
            reconnector.connection_lost(0.0),
            ReconnectDecision::RetryAfter(_)
        ));

        reconnector.begin_attempt();
        assert_eq!(reconnector.connection_lost(0.0), ReconnectDecision::GiveUp);
        // No fourth attempt is ever scheduled.
        assert_eq!(reconnector.connection_lost(1.0), ReconnectDecision::GiveUp);
    }

    #[test]
    fn successful_connect_resets_the_budget() {
        let mut reconnector = machine();

        reconnector.begin_attempt();
        reconnector.begin_attempt();
        reconnector.connected();
        assert_eq!(reconnector.attempts(), 0);

        reconnector.begin_attempt();
        assert_eq!(
            reconnector.connection_lost(0.0),
            ReconnectDecision::RetryAfter(1_500)
        );
    }

    #[test]
    fn login_reset_restores_a_spent_budget() {
        let mut reconnector = machine();
        for _ in 0..3 {
            reconnector.begin_attempt();
        }
        assert_eq!(reconnector.connection_lost(0.0), ReconnectDecision::GiveUp);

        reconnector.reset();
        reconnector.begin_attempt();
        assert!(matches!(
            reconnector.connection_lost(0.0),
            ReconnectDecision::RetryAfter(_)
        ));
    }
}
