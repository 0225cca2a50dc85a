use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Failed attempts in a row before the reader gives up.
    pub max_consecutive_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_consecutive_failures: 10,
        }
    }
}

/// Doubling delay with a cap. Lives for one logical connection: internal
/// reconnects keep growing it, only a new `connect` starts a fresh one.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            next: policy.initial_delay.min(policy.max_delay),
            max: policy.max_delay,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self
            .next
            .checked_mul(2)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }
}
