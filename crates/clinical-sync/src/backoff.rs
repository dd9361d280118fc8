//! Exponential backoff with a cap, used by the retry path (§4.5: base 1s,
//! cap 30s, up to 5 attempts).

use std::time::Duration;

/// Exponential backoff, doubling each attempt and clamped to `cap`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry attempt `n` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let scaled = self.base.saturating_mul(factor as u32);
        scaled.min(self.cap)
    }
}

/// Network quality observed by the caller, used to scale the base sync
/// interval (§4.5 `schedule_next`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
    Good,
    Fair,
    Poor,
}

/// Clamp `interval` into `[min, ..]` and scale it by network quality:
/// poor doubles it, fair multiplies by 1.5, good leaves it unchanged.
pub fn schedule_next(interval: Duration, min: Duration, quality: NetworkQuality) -> Duration {
    let clamped = interval.max(min);
    match quality {
        NetworkQuality::Good => clamped,
        NetworkQuality::Fair => clamped.mul_f64(1.5),
        NetworkQuality::Poor => clamped.saturating_mul(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(b.delay_for(1), Duration::from_secs(1));
        assert_eq!(b.delay_for(2), Duration::from_secs(2));
        assert_eq!(b.delay_for(3), Duration::from_secs(4));
        assert_eq!(b.delay_for(4), Duration::from_secs(8));
        assert_eq!(b.delay_for(5), Duration::from_secs(16));
        assert_eq!(b.delay_for(6), Duration::from_secs(30)); // would be 32, capped
    }

    #[test]
    fn schedule_next_clamps_to_minimum() {
        let got = schedule_next(Duration::from_secs(10), Duration::from_secs(60), NetworkQuality::Good);
        assert_eq!(got, Duration::from_secs(60));
    }

    #[test]
    fn schedule_next_scales_by_quality() {
        let base = Duration::from_secs(300);
        assert_eq!(schedule_next(base, Duration::from_secs(60), NetworkQuality::Good), base);
        assert_eq!(
            schedule_next(base, Duration::from_secs(60), NetworkQuality::Fair),
            Duration::from_secs(450)
        );
        assert_eq!(
            schedule_next(base, Duration::from_secs(60), NetworkQuality::Poor),
            Duration::from_secs(600)
        );
    }
}
