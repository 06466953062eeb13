//! Reconnect delay policy for the agent.

use std::time::Duration;

use rand::Rng;

use crate::config::{ReconnectConfig, ReconnectStrategy};

#[derive(Debug, Clone)]
pub struct Backoff {
    strategy: ReconnectStrategy,
    initial: Duration,
    max: Duration,
    jitter: bool,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        let initial = Duration::from_secs(config.initial_delay_secs.max(1));
        Self {
            strategy: config.strategy,
            initial,
            max: Duration::from_secs(config.max_delay_secs).max(initial),
            jitter: config.jitter,
            current: initial,
        }
    }

    /// Delay before the next attempt. Exponential delays double up to the
    /// cap; jitter spreads each one over `[d/2, d]`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        if self.strategy == ReconnectStrategy::Exponential {
            self.current = (self.current * 2).min(self.max);
        }
        self.jittered(base)
    }

    /// Back to the initial delay, after a connection that went active.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Reset and return the initial delay without advancing. Used when the
    /// master announced its own restart.
    pub fn restart(&mut self) -> Duration {
        self.reset();
        self.jittered(self.initial)
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter {
            let half = base / 2;
            half + rand::thread_rng().gen_range(Duration::ZERO..=base - half)
        } else {
            base
        }
    }
}
