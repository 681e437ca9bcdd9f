// =============================================================================
// Adapter Policy Layer — retry, timeout, and rate-limit discipline
// =============================================================================
//
// Every outbound vendor call passes through here so the rules live in one
// place instead of being scattered through call sites:
//
//   - per-endpoint-class token buckets (quotes / orders / history),
//   - a per-call patience budget while waiting on a bucket refill,
//   - a hard deadline per call (history fetches get a longer one),
//   - bounded exponential backoff with jitter for transient failures.
// =============================================================================

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use super::BrokerError;

// =============================================================================
// Endpoint classes
// =============================================================================

/// Vendor endpoint families with independent rate budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Quotes,
    Orders,
    History,
}

impl EndpointClass {
    /// Hard deadline for a single attempt.
    pub fn call_timeout(&self) -> Duration {
        match self {
            Self::Quotes | Self::Orders => Duration::from_secs(10),
            Self::History => Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Token bucket
// =============================================================================

/// Continuous-refill token bucket.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();

        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Wait on the refill up to `patience`; past the budget the caller gets
    /// [`BrokerError::RateLimited`].
    pub async fn acquire(&self, patience: Duration) -> Result<(), BrokerError> {
        let deadline = Instant::now() + patience;
        loop {
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    let now = Instant::now();
                    if now + wait > deadline {
                        return Err(BrokerError::RateLimited);
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

// =============================================================================
// Retry policy
// =============================================================================

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), jittered ±25 %.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << attempt.min(16))
            .min(self.max_delay.as_millis()) as f64;
        let jitter = rand::thread_rng().gen_range(0.75..1.25);
        Duration::from_millis((exp * jitter) as u64)
    }
}

// =============================================================================
// Policy layer
// =============================================================================

/// Request discipline shared by all of a live adapter's outbound calls.
pub struct PolicyLayer {
    quotes: TokenBucket,
    orders: TokenBucket,
    history: TokenBucket,
    /// How long a caller is willing to wait on an empty bucket.
    patience: Duration,
    retry: RetryPolicy,
}

impl PolicyLayer {
    /// Vendor-shaped defaults: quotes are cheap, orders deliberately scarce,
    /// history in between.
    pub fn new() -> Self {
        Self {
            quotes: TokenBucket::new(10, 8.0),
            orders: TokenBucket::new(5, 2.0),
            history: TokenBucket::new(3, 1.0),
            patience: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }

    #[cfg(test)]
    pub fn with_buckets(quotes: TokenBucket, orders: TokenBucket, history: TokenBucket) -> Self {
        Self {
            quotes,
            orders,
            history,
            patience: Duration::from_millis(50),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        }
    }

    fn bucket(&self, class: EndpointClass) -> &TokenBucket {
        match class {
            EndpointClass::Quotes => &self.quotes,
            EndpointClass::Orders => &self.orders,
            EndpointClass::History => &self.history,
        }
    }

    /// Run `attempt` under the full discipline: bucket acquire, deadline,
    /// and bounded retries for transient errors. Non-transient errors
    /// propagate unchanged on the first occurrence.
    pub async fn run<T, F, Fut>(
        &self,
        class: EndpointClass,
        mut attempt: F,
    ) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            self.bucket(class).acquire(self.patience).await?;

            let result = match tokio::time::timeout(class.call_timeout(), attempt()).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::NetworkFailed(format!(
                    "call exceeded {:?} deadline",
                    class.call_timeout()
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && tries < self.retry.max_attempts => {
                    let delay = self.retry.backoff_delay(tries);
                    warn!(
                        error = %err,
                        attempt = tries,
                        delay_ms = delay.as_millis() as u64,
                        "transient broker error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    debug!(error = %err, attempts = tries, "broker call failed");
                    return Err(err);
                }
            }
        }
    }
}

impl Default for PolicyLayer {
    fn default() -> Self {
        Self::new()
    }
}
