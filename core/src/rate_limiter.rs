//! Token bucket admission control
//!
//! Tokens are refilled lazily: every `acquire`, `try_acquire` and `stats`
//! call first credits the whole refill intervals that elapsed since the last
//! refill, then tries to take a token with a compare-and-swap decrement.
//! Blocked callers park on a condition variable (sync) or a [`Notify`]
//! (async) that is broadcast on every refill and every [`RateLimiter::update`].

use crate::errors::{Cancelled, ConfigError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Longest a blocked thread sleeps before it re-checks its cancellation token
pub(crate) const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Lower bound on a single wait so a token due "now" does not cause spinning
const MIN_WAIT: Duration = Duration::from_millis(1);

/// One in this many limiter operations is logged at debug level
const LOG_FREQUENCY: u64 = 100;

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Bucket capacity, also the number of tokens refilled per second
    pub permits_per_second: u64,
    /// Longest single wait of a blocked caller before it re-checks the bucket.
    /// Zero means "wait until the next token is due".
    pub cooldown: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            permits_per_second: 10,
            cooldown: Duration::from_millis(5000),
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.permits_per_second == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// Point-in-time view of the bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub current_tokens: u64,
    pub capacity: u64,
    /// Number of refills that credited at least one token
    pub refill_events: u64,
}

/// Thread-safe token bucket shared by every call of a guard
#[derive(Debug)]
pub struct RateLimiter {
    tokens: AtomicU64,
    capacity: AtomicU64,
    refill_interval_nanos: AtomicU64,
    cooldown_nanos: AtomicU64,
    /// Nanoseconds since `anchor`; only ever moves forward
    last_refill_nanos: AtomicU64,
    refill_events: AtomicU64,
    accesses: AtomicU64,
    anchor: Instant,
    lock: Mutex<()>,
    available: Condvar,
    notify: Notify,
}

impl RateLimiter {
    /// Create a full bucket
    pub fn new(config: RateLimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = config.permits_per_second;

        Ok(Self {
            tokens: AtomicU64::new(capacity),
            capacity: AtomicU64::new(capacity),
            refill_interval_nanos: AtomicU64::new(refill_interval(capacity)),
            cooldown_nanos: AtomicU64::new(duration_nanos(config.cooldown)),
            last_refill_nanos: AtomicU64::new(0),
            refill_events: AtomicU64::new(0),
            accesses: AtomicU64::new(0),
            anchor: Instant::now(),
            lock: Mutex::new(()),
            available: Condvar::new(),
            notify: Notify::new(),
        })
    }

    /// Block the current thread until a token is taken
    ///
    /// Each wait lasts at most the configured cooldown (less when the next
    /// token is due sooner); the caller then refills and tries again. Returns
    /// `Err(Cancelled)` once `cancel` fires, observed within [`CANCEL_POLL`].
    pub fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }

            if self.refill() {
                self.notify_locked();
            }

            if let Some(remaining) = self.take_token() {
                if self.should_log() {
                    debug!(remaining, "Acquired rate limiter token");
                }
                return Ok(());
            }

            let wait = self.next_wait().min(CANCEL_POLL);
            let (next, timeout) = self
                .available
                .wait_timeout(guard, wait)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;

            if timeout.timed_out() && self.should_log() {
                debug!("Rate limiter wait elapsed, retrying token acquisition");
            }
        }
    }

    /// Wait for a token without blocking a thread
    pub async fn acquire_async(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            // Registered before the check so a refill in between still wakes us
            let notified = self.notify.notified();

            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if self.try_acquire() {
                return Ok(());
            }

            let wait = self.next_wait();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Take a token if one is available, never waits
    pub fn try_acquire(&self) -> bool {
        if self.refill() {
            self.wake_waiters();
        }

        match self.take_token() {
            Some(remaining) => {
                if self.should_log() {
                    debug!(remaining, "Non-blocking token acquired");
                }
                true
            }
            None => false,
        }
    }

    /// Replace the rate parameters
    ///
    /// The live token count is clamped to the new capacity right away and
    /// every blocked caller is woken to re-evaluate.
    pub fn update(&self, permits_per_second: u64, cooldown: Duration) -> Result<(), ConfigError> {
        RateLimiterConfig {
            permits_per_second,
            cooldown,
        }
        .validate()?;

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.capacity.store(permits_per_second, Ordering::Release);
        self.refill_interval_nanos
            .store(refill_interval(permits_per_second), Ordering::Release);
        self.cooldown_nanos
            .store(duration_nanos(cooldown), Ordering::Release);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.min(permits_per_second))
            });

        info!(
            permits_per_second,
            cooldown_ms = cooldown.as_millis() as u64,
            "Rate limiter reconfigured"
        );
        self.notify_locked();
        Ok(())
    }

    /// Snapshot after crediting any elapsed refill intervals
    pub fn stats(&self) -> RateLimiterStats {
        if self.refill() {
            self.wake_waiters();
        }

        RateLimiterStats {
            current_tokens: self.tokens.load(Ordering::Acquire),
            capacity: self.capacity.load(Ordering::Acquire),
            refill_events: self.refill_events.load(Ordering::Acquire),
        }
    }

    /// Credit whole elapsed intervals; returns true if the token count rose
    fn refill(&self) -> bool {
        let interval = self.refill_interval_nanos.load(Ordering::Acquire);
        let mut last = self.last_refill_nanos.load(Ordering::Acquire);

        loop {
            let elapsed = self.now_nanos().saturating_sub(last);
            let to_add = elapsed / interval;
            if to_add == 0 {
                return false;
            }

            // Advance by whole intervals only so fractional progress is kept
            let advanced = last.saturating_add(to_add.saturating_mul(interval));
            match self.last_refill_nanos.compare_exchange(
                last,
                advanced,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let raised = self
                        .tokens
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                            let capacity = self.capacity.load(Ordering::Acquire);
                            Some(current.saturating_add(to_add).min(capacity))
                        })
                        .is_ok_and(|previous| {
                            previous < self.capacity.load(Ordering::Acquire)
                        });
                    if !raised {
                        return false;
                    }
                    self.refill_events.fetch_add(1, Ordering::AcqRel);

                    if self.should_log() {
                        debug!(
                            added = to_add,
                            current = self.tokens.load(Ordering::Acquire),
                            "Refilled rate limiter tokens"
                        );
                    }
                    return true;
                }
                Err(actual) => last = actual,
            }
        }
    }

    /// Compare-and-swap decrement; returns the tokens left on success
    fn take_token(&self) -> Option<u64> {
        let mut current = self.tokens.load(Ordering::Acquire);

        loop {
            if current == 0 {
                return None;
            }

            match self.tokens.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current - 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Time until the next token is due, bounded by the cooldown
    fn next_wait(&self) -> Duration {
        let interval = self.refill_interval_nanos.load(Ordering::Acquire);
        let last = self.last_refill_nanos.load(Ordering::Acquire);
        let elapsed = self.now_nanos().saturating_sub(last);
        let until_next = Duration::from_nanos(interval.saturating_sub(elapsed));

        let cooldown = Duration::from_nanos(self.cooldown_nanos.load(Ordering::Acquire));
        let wait = if cooldown.is_zero() {
            until_next
        } else {
            until_next.min(cooldown)
        };
        wait.max(MIN_WAIT)
    }

    fn wake_waiters(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.notify_locked();
    }

    /// Broadcast to blocked callers; the caller must hold `lock`
    fn notify_locked(&self) {
        self.available.notify_all();
        self.notify.notify_waiters();
    }

    fn now_nanos(&self) -> u64 {
        duration_nanos(self.anchor.elapsed())
    }

    fn should_log(&self) -> bool {
        self.accesses.fetch_add(1, Ordering::Relaxed) % LOG_FREQUENCY == LOG_FREQUENCY - 1
    }
}

fn refill_interval(permits_per_second: u64) -> u64 {
    (NANOS_PER_SEC / permits_per_second).max(1)
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn limiter(permits_per_second: u64, cooldown_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            permits_per_second,
            cooldown: Duration::from_millis(cooldown_ms),
        })
        .expect("valid config")
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let result = RateLimiter::new(RateLimiterConfig {
            permits_per_second: 0,
            cooldown: Duration::from_millis(100),
        });
        assert_eq!(result.unwrap_err(), ConfigError::ZeroCapacity);

        let limiter = limiter(5, 100);
        assert_eq!(
            limiter.update(0, Duration::ZERO),
            Err(ConfigError::ZeroCapacity)
        );
        assert_eq!(limiter.stats().capacity, 5);
    }

    #[test]
    fn test_capacity_then_refill() {
        let limiter = limiter(5, 1000);

        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire(), "6th permit must be refused");

        // One refill interval is 200ms at 5 permits/sec
        thread::sleep(Duration::from_millis(250));
        assert!(limiter.try_acquire());
        assert!(limiter.stats().refill_events >= 1);
    }

    #[test]
    fn test_update_clamps_tokens() {
        let limiter = limiter(10, 1000);
        assert_eq!(limiter.stats().current_tokens, 10);

        limiter.update(3, Duration::from_millis(500)).unwrap();

        let stats = limiter.stats();
        assert!(stats.current_tokens <= 3);
        assert_eq!(stats.capacity, 3);
    }

    #[test]
    fn test_update_speeds_up_refill() {
        let limiter = limiter(1, 5000);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        // 200 permits/sec refills a token every 5ms
        limiter.update(200, Duration::from_millis(50)).unwrap();

        let start = Instant::now();
        limiter.acquire(&CancellationToken::new()).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_update_wakes_blocked_acquire() {
        let limiter = Arc::new(limiter(1, 5000));
        assert!(limiter.try_acquire());

        let waiter = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                let start = Instant::now();
                limiter.acquire(&CancellationToken::new()).unwrap();
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(20));
        limiter.update(200, Duration::from_millis(50)).unwrap();

        let waited = waiter.join().unwrap();
        assert!(waited < Duration::from_millis(500), "waited {:?}", waited);
    }

    #[test]
    fn test_refill_into_full_bucket_is_not_an_event() {
        let limiter = limiter(100, 100);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(limiter.stats().refill_events, 0);

        assert!(limiter.try_acquire());
        thread::sleep(Duration::from_millis(30));
        assert_eq!(limiter.stats().refill_events, 1);
        assert_eq!(limiter.stats().current_tokens, 100);
    }

    #[test]
    fn test_blocked_acquire_waits_for_next_token_not_cooldown() {
        let limiter = limiter(5, 1000);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire(&cancel).unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(100));

        let blocked = Instant::now();
        limiter.acquire(&cancel).unwrap();
        let waited = blocked.elapsed();

        assert!(waited >= Duration::from_millis(100), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(800), "waited {:?}", waited);
    }

    #[test]
    fn test_acquire_unwinds_on_cancel() {
        let limiter = Arc::new(limiter(1, 5000));
        assert!(limiter.try_acquire());

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let start = Instant::now();
        assert_eq!(limiter.acquire(&cancel), Err(Cancelled));
        assert!(start.elapsed() < Duration::from_millis(900));
        handle.join().unwrap();
    }

    #[test]
    fn test_no_over_grant_under_contention() {
        let capacity = 50;
        let limiter = Arc::new(limiter(capacity, 100));
        let granted = Arc::new(AtomicUsize::new(0));

        let start = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let granted = Arc::clone(&granted);
                thread::spawn(move || {
                    let deadline = Instant::now() + Duration::from_millis(300);
                    while Instant::now() < deadline {
                        if limiter.try_acquire() {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        let elapsed = start.elapsed().as_secs_f64();

        // Initial bucket plus whatever could have refilled meanwhile
        let ceiling = capacity as f64 + (elapsed * capacity as f64).ceil() + 1.0;
        let total = granted.load(Ordering::SeqCst) as f64;
        assert!(total <= ceiling, "granted {} > ceiling {}", total, ceiling);
        assert!(total >= capacity as f64);
        assert!(limiter.stats().current_tokens <= capacity);
    }

    #[test]
    fn test_concurrent_blocking_acquire_all_complete() {
        let limiter = Arc::new(limiter(20, 50));
        let cancel = CancellationToken::new();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let cancel = cancel.clone();
                thread::spawn(move || {
                    for _ in 0..8 {
                        limiter.acquire(&cancel).unwrap();
                    }
                })
            })
            .collect();

        // 32 permits from a 20-token bucket: the last 12 need ~600ms of refill
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(limiter.stats().refill_events >= 1);
    }

    #[tokio::test]
    async fn test_acquire_async_waits_for_refill() {
        let limiter = limiter(10, 1000);
        let cancel = CancellationToken::new();

        for _ in 0..10 {
            limiter.acquire_async(&cancel).await.unwrap();
        }

        let start = Instant::now();
        limiter.acquire_async(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_acquire_async_cancelled() {
        let limiter = Arc::new(limiter(1, 5000));
        assert!(limiter.try_acquire());

        let cancel = CancellationToken::new();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire_async(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), Err(Cancelled));
    }
}
