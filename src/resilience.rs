//! Resilience primitives shared across upstream calls: a three-state
//! circuit breaker per upstream kind, and a token-bucket rate limiter.
//!
//! One breaker tracks each upstream kind independently, so a failing
//! synthesizer doesn't trip calls to the transcriber or generator.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Which upstream a circuit breaker tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamKind {
    Transcription,
    Generation,
    Synthesis,
}

/// Breaker state for one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Health record tracked per upstream.
#[derive(Debug, Clone)]
pub struct UpstreamHealth {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub last_success_at: Option<Instant>,
}

impl Default for UpstreamHealth {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Three-state (closed / open / half-open) breaker over a set of upstreams.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    upstreams: HashMap<UpstreamKind, UpstreamHealth>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            upstreams: HashMap::new(),
        }
    }

    /// Whether a call to `kind` should be attempted right now. Transitions
    /// `Open` to `HalfOpen` once the cooldown has elapsed.
    pub fn should_attempt(&mut self, kind: UpstreamKind) -> bool {
        let health = self.upstreams.entry(kind).or_default();
        match health.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = health
                    .last_failure_at
                    .map_or(Duration::MAX, |t| t.elapsed());
                if elapsed >= self.config.cooldown {
                    health.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: closes the breaker and resets the
    /// failure streak.
    pub fn record_success(&mut self, kind: UpstreamKind) {
        let health = self.upstreams.entry(kind).or_default();
        health.state = CircuitState::Closed;
        health.consecutive_failures = 0;
        health.last_success_at = Some(Instant::now());
    }

    /// Record a failed call: opens the breaker once `failure_threshold`
    /// consecutive failures have been observed, or immediately if the
    /// probing half-open call itself failed.
    pub fn record_failure(&mut self, kind: UpstreamKind) {
        let health = self.upstreams.entry(kind).or_default();
        health.consecutive_failures += 1;
        health.last_failure_at = Some(Instant::now());
        if health.state == CircuitState::HalfOpen
            || health.consecutive_failures >= self.config.failure_threshold
        {
            health.state = CircuitState::Open;
        }
    }

    #[must_use]
    pub fn state(&self, kind: UpstreamKind) -> CircuitState {
        self.upstreams
            .get(&kind)
            .map_or(CircuitState::Closed, |h| h.state)
    }

    pub fn reset(&mut self, kind: UpstreamKind) {
        self.upstreams.remove(&kind);
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Process-wide breaker instance shared across all sessions, since
/// rate-limiting and circuit-breaking against upstreams are cross-session
/// concerns: one session's failures should back off calls for everyone.
static GLOBAL_BREAKER: OnceLock<Mutex<CircuitBreaker>> = OnceLock::new();

/// Accessor for the process-wide breaker.
pub fn global_breaker() -> &'static Mutex<CircuitBreaker> {
    GLOBAL_BREAKER.get_or_init(|| Mutex::new(CircuitBreaker::default()))
}

/// A simple token-bucket rate limiter, refilled lazily on acquire.
pub struct TokenBucket {
    inner: Mutex<TokenBucketState>,
}

struct TokenBucketState {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    #[must_use]
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            inner: Mutex::new(TokenBucketState {
                capacity: f64::from(capacity),
                tokens: f64::from(capacity),
                refill_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempt to take one token. Returns `false` if the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.inner.lock().expect("token bucket mutex poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.refill_per_sec).min(state.capacity);
        state.last_refill = Instant::now();
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-upstream-kind token buckets, mirroring the breaker's one-per-kind
/// isolation: a saturated transcription upstream doesn't throttle synthesis.
pub struct RateLimiters {
    buckets: HashMap<UpstreamKind, TokenBucket>,
}

impl RateLimiters {
    fn new() -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(UpstreamKind::Transcription, TokenBucket::new(20, 10.0));
        buckets.insert(UpstreamKind::Generation, TokenBucket::new(20, 10.0));
        buckets.insert(UpstreamKind::Synthesis, TokenBucket::new(20, 10.0));
        Self { buckets }
    }

    /// Attempt to take one token for `kind`. Unknown kinds (there are none
    /// today) are allowed through rather than blocked.
    pub fn try_acquire(&self, kind: UpstreamKind) -> bool {
        self.buckets.get(&kind).map_or(true, TokenBucket::try_acquire)
    }
}

static GLOBAL_RATE_LIMITERS: OnceLock<RateLimiters> = OnceLock::new();

/// Accessor for the process-wide rate limiters.
pub fn global_rate_limiters() -> &'static RateLimiters {
    GLOBAL_RATE_LIMITERS.get_or_init(RateLimiters::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
        });
        assert!(breaker.should_attempt(UpstreamKind::Transcription));
        breaker.record_failure(UpstreamKind::Transcription);
        assert_eq!(breaker.state(UpstreamKind::Transcription), CircuitState::Closed);
        breaker.record_failure(UpstreamKind::Transcription);
        assert_eq!(breaker.state(UpstreamKind::Transcription), CircuitState::Open);
        assert!(!breaker.should_attempt(UpstreamKind::Transcription));
    }

    #[test]
    fn breaker_half_opens_after_cooldown() {
        let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(0),
        });
        breaker.record_failure(UpstreamKind::Synthesis);
        assert_eq!(breaker.state(UpstreamKind::Synthesis), CircuitState::Open);
        assert!(breaker.should_attempt(UpstreamKind::Synthesis));
        assert_eq!(breaker.state(UpstreamKind::Synthesis), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_millis(0),
        });
        breaker.record_failure(UpstreamKind::Generation);
        breaker.should_attempt(UpstreamKind::Generation); // moves to half-open
        breaker.record_failure(UpstreamKind::Generation);
        assert_eq!(breaker.state(UpstreamKind::Generation), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut breaker = CircuitBreaker::default();
        breaker.record_failure(UpstreamKind::Transcription);
        breaker.record_success(UpstreamKind::Transcription);
        assert_eq!(breaker.state(UpstreamKind::Transcription), CircuitState::Closed);
    }

    #[test]
    fn token_bucket_exhausts_and_refills() {
        let bucket = TokenBucket::new(1, 1000.0);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn rate_limiters_isolate_per_upstream_kind() {
        let mut buckets = HashMap::new();
        buckets.insert(UpstreamKind::Synthesis, TokenBucket::new(1, 0.0));
        buckets.insert(UpstreamKind::Transcription, TokenBucket::new(1, 0.0));
        let limiters = RateLimiters { buckets };

        assert!(limiters.try_acquire(UpstreamKind::Synthesis));
        assert!(!limiters.try_acquire(UpstreamKind::Synthesis));
        assert!(limiters.try_acquire(UpstreamKind::Transcription));
    }
}
