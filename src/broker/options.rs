//! Broker-wide defaults and per-subscription overrides.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Capacity of each subscription's delivery queue.
    pub buffer_size: usize,
    /// Retries after the initial attempt; total attempts = 1 + max_retries.
    pub max_retries: u32,
    /// Retry n (1-based) waits `retry_backoff_base * 2^(n-1)`.
    pub retry_backoff_base: Duration,
    /// When set, a successful delivery must be acked within this window.
    pub ack_timeout: Option<Duration>,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub rate_limit_interval: Option<Duration>,
    /// Bound on how long `close` and `unsubscribe` wait for workers.
    pub shutdown_grace_period: Duration,
    /// How often the ack sweeper scans for expired deadlines.
    pub ack_sweep_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            max_retries: 3,
            retry_backoff_base: Duration::from_secs(1),
            ack_timeout: None,
            failure_threshold: 5,
            cooldown: Duration::from_secs(10),
            rate_limit_interval: None,
            shutdown_grace_period: Duration::from_secs(5),
            ack_sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Per-subscription overrides. Unset fields inherit the broker's config.
///
/// ```
/// use std::time::Duration;
/// use pubsub_broker::SubscribeOptions;
///
/// let options = SubscribeOptions::new()
///     .buffer_size(10)
///     .rate_limit_interval(Duration::from_millis(50));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    buffer_size: Option<usize>,
    max_retries: Option<u32>,
    retry_backoff_base: Option<Duration>,
    ack_timeout: Option<Duration>,
    rate_limit_interval: Option<Duration>,
    failure_threshold: Option<u32>,
    cooldown: Option<Duration>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn retry_backoff_base(mut self, base: Duration) -> Self {
        self.retry_backoff_base = Some(base);
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    pub fn rate_limit_interval(mut self, interval: Duration) -> Self {
        self.rate_limit_interval = Some(interval);
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub(crate) fn resolve(&self, defaults: &BrokerConfig) -> SubscriptionPolicy {
        SubscriptionPolicy {
            // tokio's bounded channel panics on zero capacity
            buffer_size: self.buffer_size.unwrap_or(defaults.buffer_size).max(1),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_backoff_base: self
                .retry_backoff_base
                .unwrap_or(defaults.retry_backoff_base),
            ack_timeout: self.ack_timeout.or(defaults.ack_timeout),
            rate_limit_interval: self.rate_limit_interval.or(defaults.rate_limit_interval),
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            cooldown: self.cooldown.unwrap_or(defaults.cooldown),
        }
    }
}

/// Effective settings of one subscription after applying overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SubscriptionPolicy {
    pub buffer_size: usize,
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub ack_timeout: Option<Duration>,
    pub rate_limit_interval: Option<Duration>,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl SubscriptionPolicy {
    /// Delay before `attempt` (0 is the initial try and never waits).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.retry_backoff_base.saturating_mul(factor)
    }
}
