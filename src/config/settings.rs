use std::time::Duration;

use serde::Deserialize;

use crate::broker::options::BrokerConfig;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Broker tuning. Durations are in milliseconds; an absent or zero
/// `ack_timeout_ms` / `rate_limit_interval_ms` disables the feature.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub buffer_size: usize,
    pub max_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub ack_timeout_ms: Option<u64>,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub rate_limit_interval_ms: Option<u64>,
    pub shutdown_grace_period_ms: u64,
    pub ack_sweep_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

impl BrokerSettings {
    pub fn to_broker_config(&self) -> BrokerConfig {
        let millis = Duration::from_millis;
        let enabled = |ms: Option<u64>| ms.filter(|ms| *ms > 0).map(millis);
        BrokerConfig {
            buffer_size: self.buffer_size,
            max_retries: self.max_retries,
            retry_backoff_base: millis(self.retry_backoff_base_ms),
            ack_timeout: enabled(self.ack_timeout_ms),
            failure_threshold: self.failure_threshold,
            cooldown: millis(self.cooldown_ms),
            rate_limit_interval: enabled(self.rate_limit_interval_ms),
            shutdown_grace_period: millis(self.shutdown_grace_period_ms),
            ack_sweep_interval: millis(self.ack_sweep_interval_ms),
        }
    }
}

impl From<&BrokerConfig> for BrokerSettings {
    fn from(config: &BrokerConfig) -> Self {
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self {
            buffer_size: config.buffer_size,
            max_retries: config.max_retries,
            retry_backoff_base_ms: millis(config.retry_backoff_base),
            ack_timeout_ms: config.ack_timeout.map(millis),
            failure_threshold: config.failure_threshold,
            cooldown_ms: millis(config.cooldown),
            rate_limit_interval_ms: config.rate_limit_interval.map(millis),
            shutdown_grace_period_ms: millis(config.shutdown_grace_period),
            ack_sweep_interval_ms: millis(config.ack_sweep_interval),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; `merge` fills the gaps from defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerSettings {
    pub buffer_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_backoff_base_ms: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub cooldown_ms: Option<u64>,
    pub rate_limit_interval_ms: Option<u64>,
    pub shutdown_grace_period_ms: Option<u64>,
    pub ack_sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    pub fn merge(self, default: Settings) -> Settings {
        let broker = self.broker.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();
        let d = default.broker;

        Settings {
            broker: BrokerSettings {
                buffer_size: broker.buffer_size.unwrap_or(d.buffer_size),
                max_retries: broker.max_retries.unwrap_or(d.max_retries),
                retry_backoff_base_ms: broker
                    .retry_backoff_base_ms
                    .unwrap_or(d.retry_backoff_base_ms),
                ack_timeout_ms: broker.ack_timeout_ms.or(d.ack_timeout_ms),
                failure_threshold: broker.failure_threshold.unwrap_or(d.failure_threshold),
                cooldown_ms: broker.cooldown_ms.unwrap_or(d.cooldown_ms),
                rate_limit_interval_ms: broker
                    .rate_limit_interval_ms
                    .or(d.rate_limit_interval_ms),
                shutdown_grace_period_ms: broker
                    .shutdown_grace_period_ms
                    .unwrap_or(d.shutdown_grace_period_ms),
                ack_sweep_interval_ms: broker
                    .ack_sweep_interval_ms
                    .unwrap_or(d.ack_sweep_interval_ms),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}

/// Provides default values for `Settings`, mirroring `BrokerConfig::default`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::from(&BrokerConfig::default()),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
