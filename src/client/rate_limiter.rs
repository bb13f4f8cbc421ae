use super::key_pool::ApiKeyPool;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Global throttle for outbound upstream calls.
///
/// The spacing depends on pool health: the short interval while any key is
/// healthy, the long one otherwise. Every caller reserves the next free slot
/// and sleeps until it, so dispatch times of successive calls are at least one
/// interval apart.
#[derive(Debug)]
pub struct RateGovernor {
    pool: Arc<ApiKeyPool>,
    last_request_time: Mutex<Option<Instant>>,
}

impl RateGovernor {
    #[must_use]
    pub fn new(pool: Arc<ApiKeyPool>) -> Self {
        Self {
            pool,
            last_request_time: Mutex::new(None),
        }
    }

    /// Minimum spacing to keep before the next request
    #[must_use]
    pub fn delay_before_next_request(&self) -> Duration {
        self.pool.rate_limit_delay()
    }

    /// Wait until it's safe to make a request
    pub async fn acquire(&self) {
        let interval = self.delay_before_next_request();
        let slot = {
            let mut last = self
                .last_request_time
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = match *last {
                Some(previous) if previous + interval > now => previous + interval,
                _ => now,
            };
            *last = Some(slot);
            slot
        };

        let now = Instant::now();
        if slot > now {
            debug!("Rate limiter: waiting {}ms", (slot - now).as_millis());
            sleep_until(slot).await;
        }
        debug!("Rate limiter: request permitted");
    }

    /// Check if a request would be allowed without waiting
    #[must_use]
    pub fn check(&self) -> bool {
        self.time_until_ready().is_none()
    }

    /// Get time until next request is allowed
    #[must_use]
    pub fn time_until_ready(&self) -> Option<Duration> {
        let interval = self.delay_before_next_request();
        let last = *self
            .last_request_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        last.and_then(|last_time| {
            let ready_at = last_time + interval;
            let now = Instant::now();
            (ready_at > now).then(|| ready_at - now)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::key_pool::{Credential, KeyStrategy, MAX_FAILURES_BEFORE_UNHEALTHY};

    fn keyed_pool() -> Arc<ApiKeyPool> {
        Arc::new(ApiKeyPool::new(
            vec![Credential::new("abcdefgh1234", "a@example.com")],
            KeyStrategy::Single,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_is_immediate_second_waits() {
        let governor = RateGovernor::new(keyed_pool());
        assert!(governor.check());

        let start = Instant::now();
        governor.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!governor.check());

        governor.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_after_interval_elapsed() {
        let governor = RateGovernor::new(Arc::new(ApiKeyPool::anonymous()));
        governor.acquire().await;

        tokio::time::advance(Duration::from_millis(400)).await;
        let start = Instant::now();
        governor.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_spaced() {
        let governor = Arc::new(RateGovernor::new(Arc::new(ApiKeyPool::anonymous())));
        let start = Instant::now();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let governor = Arc::clone(&governor);
                tokio::spawn(async move {
                    governor.acquire().await;
                    start.elapsed()
                })
            })
            .collect();

        let mut dispatched = Vec::new();
        for handle in handles {
            dispatched.push(handle.await.unwrap());
        }
        dispatched.sort();

        assert_eq!(dispatched[0], Duration::ZERO);
        assert!(dispatched[1] >= Duration::from_millis(334));
        assert!(dispatched[2] >= Duration::from_millis(668));
    }

    #[test]
    fn test_delay_tracks_pool_health() {
        let pool = keyed_pool();
        let governor = RateGovernor::new(Arc::clone(&pool));
        assert_eq!(governor.delay_before_next_request(), Duration::from_millis(100));

        let key = pool.select().unwrap();
        for _ in 0..MAX_FAILURES_BEFORE_UNHEALTHY {
            pool.report_failure(&key);
        }
        assert_eq!(governor.delay_before_next_request(), Duration::from_millis(334));

        // forced recovery makes a key healthy again
        assert!(pool.select().is_some());
        assert_eq!(pool.status().healthy_keys, 1);
        assert_eq!(governor.delay_before_next_request(), Duration::from_millis(100));
    }
}
