//! Wall-clock access as an explicit dependency rather than a singleton
//! (design note: "singleton managers ... convert to explicit dependencies
//! constructed once at process start").

use async_trait::async_trait;

/// Supplies the current time and node identity to callers that need to
/// stamp a vector clock or an audit entry, so tests can inject a
/// deterministic source instead of reading the system clock directly.
#[async_trait]
pub trait ClockEffects: Send + Sync {
    /// Nanoseconds since an arbitrary but consistent epoch for this process.
    fn now_ns(&self) -> u64;
}

/// Reference implementation backed by the system clock. Not used in
/// property tests, where a deterministic fake is preferred.
#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl ClockEffects for SystemClock {
    fn now_ns(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonically_nondecreasing() {
        let clock = SystemClock;
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }
}
