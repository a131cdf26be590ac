use crate::broker::BrokerConfig;
use crate::error::AppError;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Max buffered events per offline user (default: 100)
    pub backlog_capacity: usize,
    /// Heartbeat interval in seconds (default: 30)
    pub heartbeat_interval_secs: u64,
    /// Events a connection may have waiting for its writer (default: 256)
    pub outbound_capacity: usize,
    /// Per-connection channel capacity (default: 64)
    pub sink_buffer: usize,
    /// How long a write may wait on a full connection channel (default: 5000)
    pub write_timeout_ms: u64,
    /// SSE `retry:` hint sent to clients for auto-reconnect (default: 3000)
    pub sse_retry_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: 100,
            heartbeat_interval_secs: 30,
            outbound_capacity: 256,
            sink_buffer: 64,
            write_timeout_ms: 5000,
            sse_retry_ms: 3000,
        }
    }
}

impl NotifyConfig {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            backlog_capacity: self.backlog_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            outbound_capacity: self.outbound_capacity,
            sink_buffer: self.sink_buffer,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let defaults = NotifyConfig::default();

        let config = Config {
            app: AppConfig {
                env: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
                host: env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("APP_PORT", 8000)?,
            },
            notify: NotifyConfig {
                backlog_capacity: parse_var("NOTIFY_BACKLOG_CAPACITY", defaults.backlog_capacity)?,
                heartbeat_interval_secs: parse_var(
                    "NOTIFY_HEARTBEAT_INTERVAL_SECS",
                    defaults.heartbeat_interval_secs,
                )?,
                outbound_capacity: parse_var(
                    "NOTIFY_OUTBOUND_CAPACITY",
                    defaults.outbound_capacity,
                )?,
                sink_buffer: parse_var("NOTIFY_SINK_BUFFER", defaults.sink_buffer)?,
                write_timeout_ms: parse_var("NOTIFY_WRITE_TIMEOUT_MS", defaults.write_timeout_ms)?,
                sse_retry_ms: parse_var("NOTIFY_SSE_RETRY_MS", defaults.sse_retry_ms)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        let notify = &self.notify;
        if notify.backlog_capacity == 0 {
            return Err(AppError::Config("NOTIFY_BACKLOG_CAPACITY must be > 0".into()));
        }
        if notify.heartbeat_interval_secs == 0 {
            return Err(AppError::Config(
                "NOTIFY_HEARTBEAT_INTERVAL_SECS must be > 0".into(),
            ));
        }
        if notify.outbound_capacity == 0 {
            return Err(AppError::Config("NOTIFY_OUTBOUND_CAPACITY must be > 0".into()));
        }
        if notify.sink_buffer == 0 {
            return Err(AppError::Config("NOTIFY_SINK_BUFFER must be > 0".into()));
        }
        if notify.write_timeout_ms == 0 {
            return Err(AppError::Config("NOTIFY_WRITE_TIMEOUT_MS must be > 0".into()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.app.host, self.app.port)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{name} is not a valid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}
