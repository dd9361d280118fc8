//! Outbound token bucket (§4.10, §5: "Outbound sync batches respect a
//! token bucket of 1000 operations/s"). A small leaky-bucket counter keyed
//! by an injectable `now_ns` clock, following the same testable-without-
//! real-time convention used by `clinical-emr::breaker::CircuitBreaker`.

use parking_lot::Mutex;

/// Default outbound rate (§5).
pub const DEFAULT_OPS_PER_SECOND: u32 = 1000;

struct BucketState {
    tokens: f64,
    last_refill_ns: u64,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_ns: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(ops_per_second: u32, now_ns: u64) -> Self {
        let capacity = ops_per_second as f64;
        Self {
            capacity,
            refill_per_ns: capacity / 1_000_000_000.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill_ns: now_ns,
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now_ns: u64) {
        let elapsed = now_ns.saturating_sub(state.last_refill_ns) as f64;
        state.tokens = (state.tokens + elapsed * self.refill_per_ns).min(self.capacity);
        state.last_refill_ns = now_ns;
    }

    /// Attempt to spend `count` tokens at `now_ns`; returns `true` and
    /// deducts the tokens on success, `false` (no deduction) if the bucket
    /// doesn't have enough.
    pub fn try_acquire(&self, count: u32, now_ns: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now_ns);
        let cost = count as f64;
        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }
}
