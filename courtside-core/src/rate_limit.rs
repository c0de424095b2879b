use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Token bucket bounding the request rate of one source. Over any window
/// `T` at most `capacity + T * refill_per_sec` tokens are handed out.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TokenBucket");
        debug
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec);
        match self.state.try_lock() {
            Ok(state) => {
                debug.field("tokens", &state.tokens);
            }
            Err(_) => {
                debug.field("tokens", &"<locked>");
            }
        }
        debug.finish()
    }
}

/// Returned when no token became available within the allowed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenWaitExceeded {
    pub waited: Duration,
}

impl fmt::Display for TokenWaitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no rate-limit token within {:?}", self.waited)
    }
}

impl std::error::Error for TokenWaitExceeded {}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens
            + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        state.last_refill = now;
    }

    /// Tokens available right now, fractional part included.
    pub fn available(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    pub fn has_token(&self) -> bool {
        self.available() >= 1.0
    }

    /// Takes one token if available. Never drives the balance negative.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token is available.
    pub fn time_until_available(&self) -> Duration {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
        }
    }

    /// Waits for a token, giving up once `max_wait` would be exceeded.
    pub async fn acquire(
        &self,
        max_wait: Duration,
    ) -> Result<(), TokenWaitExceeded> {
        let started = Instant::now();
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            let waited = started.elapsed();
            let wait = self.time_until_available().max(Duration::from_millis(1));
            if waited + wait > max_wait {
                return Err(TokenWaitExceeded { waited });
            }
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_limited_to_capacity() {
        let bucket = TokenBucket::new(3.0, 1.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert!(bucket.available() >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_over_a_window_respect_the_bound() {
        let bucket = TokenBucket::new(4.0, 2.0);
        let window = Duration::from_secs(10);
        let started = Instant::now();
        let mut granted = 0u32;

        while started.elapsed() < window {
            if bucket.try_acquire() {
                granted += 1;
            }
            tokio::time::advance(Duration::from_millis(50)).await;
        }

        let bound = 4.0 + window.as_secs_f64() * 2.0;
        assert!(f64::from(granted) <= bound, "{granted} > {bound}");
        assert!(granted >= 20, "bucket starved: {granted}");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1.0, 2.0);
        assert!(bucket.try_acquire());

        let started = Instant::now();
        bucket.acquire(Duration::from_secs(5)).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(499), "{waited:?}");
        assert!(waited < Duration::from_secs(1), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_gives_up_after_bounded_wait() {
        let bucket = TokenBucket::new(1.0, 0.1);
        assert!(bucket.try_acquire());
        let err = bucket.acquire(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.waited <= Duration::from_secs(2));
        assert!(!bucket.try_acquire());
    }
}
