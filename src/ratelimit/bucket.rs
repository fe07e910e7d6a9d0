//! Token bucket accounting for a single (signature, path) pair.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use super::rate::RateSpec;

/// Outcome of charging one request against a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A token was available.
    Admitted,
    /// The bucket is exhausted until the next refill.
    Rejected {
        /// Time until the bucket is reset to full.
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Snapshot returned to the reaper after it inspected a bucket.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IdleCheck {
    pub last_access_at: Instant,
    pub retired: bool,
}

#[derive(Debug)]
struct BucketState {
    /// Never below -1; in `0..=capacity` right after a refill.
    tokens: i64,
    rate: RateSpec,
    last_refill_at: Instant,
    last_access_at: Instant,
    /// Set by the reaper once the bucket has been unlinked from its box.
    retired: bool,
}

impl BucketState {
    /// Periodic reset: once at least one full period has elapsed the bucket
    /// is refilled to exactly `capacity`, and the refill mark advances by
    /// whole periods so the window phase is preserved.
    fn refill(&mut self, now: Instant) {
        let period = self.rate.refill_period().as_nanos();
        let elapsed = now.saturating_duration_since(self.last_refill_at).as_nanos();
        if elapsed < period {
            return;
        }
        let remainder = (elapsed % period) as u64;
        self.tokens = i64::from(self.rate.capacity());
        self.last_refill_at = now - Duration::from_nanos(remainder);
    }

    fn until_refill(&self, now: Instant) -> Duration {
        self.rate
            .refill_period()
            .saturating_sub(now.saturating_duration_since(self.last_refill_at))
    }
}

/// A token bucket guarded by its own lock.
///
/// Refill and decrement always happen together under the lock, so decisions
/// for the same bucket are totally ordered.
#[derive(Debug)]
pub struct Bucket {
    state: Mutex<BucketState>,
}

impl Bucket {
    /// Create a full bucket.
    pub fn new(rate: RateSpec, now: Instant) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: i64::from(rate.capacity()),
                rate,
                last_refill_at: now,
                last_access_at: now,
                retired: false,
            }),
        }
    }

    /// Charge one request.
    ///
    /// Denied requests still cost their slot: the count stays at -1 until the
    /// next refill. Returns `None` if the reaper retired this bucket, in which
    /// case the caller must look the bucket up again.
    pub fn try_acquire(&self, now: Instant) -> Option<Admission> {
        let mut state = self.state.lock();
        if state.retired {
            return None;
        }

        state.refill(now);
        // Requests may reach the lock out of clock order
        state.last_access_at = state.last_access_at.max(now);

        if state.tokens > 0 {
            state.tokens -= 1;
            Some(Admission::Admitted)
        } else {
            state.tokens = -1;
            Some(Admission::Rejected {
                retry_after: state.until_refill(now),
            })
        }
    }

    /// Tokens left as of `now`, after applying any pending refill.
    pub fn tokens(&self, now: Instant) -> i64 {
        let mut state = self.state.lock();
        state.refill(now);
        state.tokens
    }

    /// The quota this bucket enforces.
    pub fn rate(&self) -> RateSpec {
        self.state.lock().rate
    }

    /// Retire the bucket if it has not been touched for `ttl`.
    pub(crate) fn retire_if_idle(&self, now: Instant, ttl: Duration) -> IdleCheck {
        let mut state = self.state.lock();
        if now.saturating_duration_since(state.last_access_at) >= ttl {
            state.retired = true;
        }
        IdleCheck {
            last_access_at: state.last_access_at,
            retired: state.retired,
        }
    }
}
