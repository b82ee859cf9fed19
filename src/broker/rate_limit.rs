//! Fixed-interval gate owned by one delivery worker.
//!
//! Each permitted invocation must be at least `interval` after the previous
//! one. There is no bursting and no coordination between subscriptions.
//! Without an interval the gate never waits.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::utils::BrokerError;

#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    last_permit: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval: interval.filter(|i| !i.is_zero()),
            last_permit: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Wait for the next permitted slot, or return `Cancelled` if `cancel`
    /// fires first. A cancelled wait does not consume the slot.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        let Some(interval) = self.interval else {
            return Ok(());
        };

        if let Some(last) = self.last_permit {
            let next = last + interval;
            if Instant::now() < next {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                    _ = sleep_until(next) => {}
                }
            }
        }

        self.last_permit = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_gate_never_waits() {
        let mut limiter = RateLimiter::new(None);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.wait(&cancel).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn zero_interval_is_disabled() {
        let limiter = RateLimiter::new(Some(Duration::ZERO));
        assert!(limiter.interval().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_permits_by_interval() {
        let mut limiter = RateLimiter::new(Some(Duration::from_millis(100)));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        limiter.wait(&cancel).await.unwrap();
        limiter.wait(&cancel).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_returns_early() {
        let mut limiter = RateLimiter::new(Some(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();

        cancel.cancel();
        let result = limiter.wait(&cancel).await;
        assert_eq!(result, Err(BrokerError::Cancelled));
    }
}
