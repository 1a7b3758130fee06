//! Backoff strategies for retry loops

use std::time::Duration;

use rand::Rng;

/// Delay schedule for retry loops (lock polling, compare-and-set conflicts).
///
/// `attempt` is 1-based: the first delay is the one slept after the first
/// failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay between every attempt.
    Fixed(Duration),
    /// Delay grows linearly with the attempt number.
    Linear(Duration),
    /// Linear growth capped at `cap`, with the actual sleep drawn uniformly
    /// from `base..=scaled` so that contending writers fan out instead of
    /// colliding on the same schedule.
    Jittered { base: Duration, cap: Duration },
}

impl Backoff {
    pub fn fixed_ms(millis: u64) -> Self {
        Self::Fixed(Duration::from_millis(millis))
    }

    pub fn jittered_ms(base_millis: u64, cap_millis: u64) -> Self {
        Self::Jittered {
            base: Duration::from_millis(base_millis),
            cap: Duration::from_millis(cap_millis),
        }
    }

    /// Schedule used for compare-and-set conflicts.
    pub fn default_cas() -> Self {
        Self::jittered_ms(20, 200)
    }

    /// Delay to sleep after the given failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed(d) => *d,
            Self::Linear(d) => d.saturating_mul(attempt),
            Self::Jittered { base, cap } => {
                let scaled = base.saturating_mul(attempt).min(*cap);
                if scaled <= *base {
                    return *base;
                }
                let spread = scaled.as_millis() as u64 - base.as_millis() as u64;
                let extra = rand::thread_rng().gen_range(0..=spread);
                *base + Duration::from_millis(extra)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::fixed_ms(50)
    }
}
