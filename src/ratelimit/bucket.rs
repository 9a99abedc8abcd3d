//! Token bucket implementation.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use super::clock::{Clock, SystemClock};
use crate::error::{Result, TurnstileError};

/// Fixed-point scale: one token is this many micro-tokens.
const SCALE: u64 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// A token bucket holding up to `capacity` tokens, refilled continuously at
/// `rate` tokens per second.
///
/// Token counts are kept in fixed point so fractional rates accrue exactly.
/// Refill is lazy: it happens on every read or take, based on the time elapsed
/// since the previous refill, and is clamped to `capacity`.
///
/// All state lives behind one mutex, so a bucket can be shared by any number
/// of concurrent callers.
pub struct TokenBucket {
    /// Maximum number of whole tokens
    capacity: u64,
    /// Configured refill rate in tokens per second
    rate: f64,
    /// `capacity` in micro-tokens
    capacity_scaled: u64,
    /// Refill rate in micro-tokens per second
    rate_scaled: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

struct BucketState {
    /// Available micro-tokens, always within `[0, capacity_scaled]`
    tokens: u64,
    last_refill: Instant,
    /// Sub-micro-token refill carried between refills, in micro-token nanoseconds
    residue: u128,
}

impl TokenBucket {
    /// Create a full bucket using the system clock.
    pub fn new(capacity: u64, rate: f64) -> Result<Self> {
        Self::with_clock(capacity, rate, Arc::new(SystemClock))
    }

    /// Create a full bucket that reads time from `clock`.
    ///
    /// Fails with [`TurnstileError::InvalidBucket`] when `capacity` is zero or
    /// `rate` is not a positive finite number.
    pub fn with_clock(capacity: u64, rate: f64, clock: Arc<dyn Clock>) -> Result<Self> {
        let (capacity_scaled, rate_scaled) = Self::scaled(capacity, rate)?;

        let now = clock.now();
        Ok(Self {
            capacity,
            rate,
            capacity_scaled,
            rate_scaled,
            clock,
            state: Mutex::new(BucketState {
                tokens: capacity_scaled,
                last_refill: now,
                residue: 0,
            }),
        })
    }

    /// Check that `capacity` and `rate` describe a usable bucket.
    pub fn validate(capacity: u64, rate: f64) -> Result<()> {
        Self::scaled(capacity, rate).map(|_| ())
    }

    fn scaled(capacity: u64, rate: f64) -> Result<(u64, u64)> {
        let invalid = || TurnstileError::InvalidBucket { capacity, rate };

        if capacity == 0 || !rate.is_finite() || rate <= 0.0 {
            return Err(invalid());
        }

        let rate_scaled = (rate * SCALE as f64).floor();
        if rate_scaled < 1.0 || rate_scaled >= u64::MAX as f64 {
            return Err(invalid());
        }
        let capacity_scaled = capacity.checked_mul(SCALE).ok_or_else(invalid)?;

        Ok((capacity_scaled, rate_scaled as u64))
    }

    /// Try to remove `n` tokens.
    ///
    /// Returns `true` and consumes the tokens if at least `n` are available
    /// after refilling, otherwise returns `false` and leaves the balance as
    /// refilled.
    pub fn try_take(&self, n: u64) -> bool {
        let Some(needed) = n.checked_mul(SCALE) else {
            return false;
        };

        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= needed {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after refilling.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens as f64 / SCALE as f64
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.last_refill = now;

        if state.tokens >= self.capacity_scaled {
            state.residue = 0;
            return;
        }

        let accrued = elapsed
            .as_nanos()
            .saturating_mul(self.rate_scaled as u128)
            .saturating_add(state.residue);
        let added = accrued / NANOS_PER_SEC;
        let room = (self.capacity_scaled - state.tokens) as u128;

        if added >= room {
            state.tokens = self.capacity_scaled;
            state.residue = 0;
        } else {
            state.tokens += added as u64;
            state.residue = accrued % NANOS_PER_SEC;
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("rate", &self.rate)
            .finish_non_exhaustive()
    }
}
