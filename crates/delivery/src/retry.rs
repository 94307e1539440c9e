use std::time::Duration;

/// Strategy for computing the delay before the next delivery attempt.
///
/// All variants clamp the computed delay to their configured maximum.
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    /// Exponential backoff: `base * multiplier^attempt`, optionally with
    /// deterministic jitter so concurrent deliveries do not retry in
    /// lockstep.
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
        jitter: bool,
    },
    /// Constant delay between attempts.
    Constant { delay: Duration },
}

impl RetryStrategy {
    /// Delay before retrying after the zero-based `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Exponential {
                base,
                max,
                multiplier,
                jitter,
            } => {
                #[allow(clippy::cast_possible_wrap)]
                let raw = base.as_secs_f64() * multiplier.powi(attempt as i32);
                let adjusted = if *jitter {
                    // Deterministic jitter: +0% to +40% keyed on the attempt
                    // number, no RNG needed.
                    raw * (1.0 + 0.1 * f64::from(attempt % 5))
                } else {
                    raw
                };
                Duration::from_secs_f64(adjusted.min(max.as_secs_f64()))
            }
            Self::Constant { delay } => *delay,
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_growth_and_clamp() {
        let strategy = RetryStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(strategy.delay_for(0), Duration::from_millis(100));
        assert_eq!(strategy.delay_for(1), Duration::from_millis(200));
        assert_eq!(strategy.delay_for(2), Duration::from_millis(400));
        // 100ms * 2^6 = 6.4s, clamped to 1s.
        assert_eq!(strategy.delay_for(6), Duration::from_secs(1));
    }

    #[test]
    fn jitter_is_deterministic() {
        let strategy = RetryStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        };
        assert_eq!(strategy.delay_for(1), strategy.delay_for(1));
        // attempt 1 gets +10%: 200ms * 1.1 = 220ms.
        assert_eq!(strategy.delay_for(1), Duration::from_millis(220));
    }

    #[test]
    fn constant_is_flat() {
        let strategy = RetryStrategy::Constant {
            delay: Duration::from_secs(2),
        };
        assert_eq!(strategy.delay_for(0), Duration::from_secs(2));
        assert_eq!(strategy.delay_for(9), Duration::from_secs(2));
    }
}
