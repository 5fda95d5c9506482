use std::time::Duration;

use keel_common::config;

/// How long to wait between successive attempts of a retried operation.
/// The strategy is configuration; the mutable per-operation state lives in
/// the [`Backoff`] it produces.
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    Fixed {
        delay: Duration,
    },
    ExponentialBackoff {
        initial_delay: Duration,
        max_delay: Duration,
        factor: u32,
    },
}

impl RetryStrategy {
    /// The delay state machine for one retried operation.
    /// There is no attempt bound: callers keep retrying until the operation
    /// succeeds or is abandoned. Reliable delivery pipelines hold one
    /// backoff per in-flight item and rewind it on acknowledgement.
    pub fn backoff(&self) -> Backoff {
        match self {
            Self::Fixed { delay } => Backoff::new(*delay, *delay, 1),
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                factor,
            } => Backoff::new(*initial_delay, *max_delay, *factor),
        }
    }
}

impl From<&config::RetryStrategy> for RetryStrategy {
    fn from(config: &config::RetryStrategy) -> Self {
        match config {
            config::RetryStrategy::Fixed { delay_secs } => Self::Fixed {
                delay: Duration::from_secs(*delay_secs),
            },
            config::RetryStrategy::ExponentialBackoff {
                initial_delay_secs,
                max_delay_secs,
                factor,
            } => Self::ExponentialBackoff {
                initial_delay: Duration::from_secs(*initial_delay_secs),
                max_delay: Duration::from_secs(*max_delay_secs),
                factor: *factor,
            },
        }
    }
}

/// Mutable backoff state for one retried operation.
/// [`Backoff::delay`] is the wait before the next attempt;
/// [`Backoff::advance`] grows it by the factor up to the cap and returns the
/// new delay; a success rewinds the state with [`Backoff::reset`].
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: u32) -> Self {
        Self {
            initial,
            max: std::cmp::max(initial, max),
            factor: std::cmp::max(factor, 1),
            current: initial,
        }
    }

    pub fn delay(&self) -> Duration {
        self.current
    }

    pub fn advance(&mut self) -> Duration {
        self.current = self
            .current
            .checked_mul(self.factor)
            .map(|delay| std::cmp::min(delay, self.max))
            .unwrap_or(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_caps_and_resets() {
        let strategy = RetryStrategy::ExponentialBackoff {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            factor: 2,
        };
        let mut backoff = strategy.backoff();
        assert_eq!(backoff.delay(), Duration::from_secs(10));
        assert_eq!(backoff.advance(), Duration::from_secs(20));
        assert_eq!(backoff.advance(), Duration::from_secs(30));
        assert_eq!(backoff.advance(), Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_strategy_never_grows() {
        let strategy = RetryStrategy::Fixed {
            delay: Duration::from_secs(1),
        };
        let mut backoff = strategy.backoff();
        assert_eq!(backoff.advance(), Duration::from_secs(1));
        assert_eq!(backoff.advance(), Duration::from_secs(1));
    }

    #[test]
    fn test_degenerate_factor_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1), 0);
        // The cap can never undercut the initial delay, and a zero factor
        // does not collapse the delay to nothing.
        assert_eq!(backoff.advance(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_conversion() {
        let config = config::RetryStrategy::ExponentialBackoff {
            initial_delay_secs: 10,
            max_delay_secs: 600,
            factor: 2,
        };
        let strategy = RetryStrategy::from(&config);
        let RetryStrategy::ExponentialBackoff {
            initial_delay,
            max_delay,
            factor,
        } = strategy
        else {
            panic!("expected an exponential backoff strategy");
        };
        assert_eq!(initial_delay, Duration::from_secs(10));
        assert_eq!(max_delay, Duration::from_secs(600));
        assert_eq!(factor, 2);

        let config = config::RetryStrategy::Fixed { delay_secs: 1 };
        let strategy = RetryStrategy::from(&config);
        assert_eq!(strategy.backoff().delay(), Duration::from_secs(1));
    }
}
