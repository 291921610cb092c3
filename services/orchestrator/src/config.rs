use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::db::DbConfig;
use crate::k6::K6Config;
use crate::sync::{DEFAULT_SYNC_INTERVAL, MAX_SYNC_INTERVAL, MIN_SYNC_INTERVAL};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub sync: SyncConfig,
    pub kube: K6Config,
}

/// Sync loop configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between reconciliation passes.
    pub interval: Duration,

    /// Whether the loop starts with the service, or waits for an
    /// operator to start it over the API.
    pub auto_start: bool,

    /// Lock TTL as a multiple of the interval.
    pub lock_ttl_factor: f64,

    /// Staleness threshold for the operator surface.
    pub stale_after: Duration,

    /// Shared secret for the manual sync trigger (unset disables the
    /// check).
    pub api_secret: Option<String>,

    /// Trailing log lines captured per container.
    pub log_tail_lines: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            auto_start: true,
            lock_ttl_factor: 2.0,
            stale_after: Duration::from_secs(60),
            api_secret: None,
            log_tail_lines: 1000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = SyncConfig::default();

        let interval = match std::env::var("K6_SYNC_INTERVAL_SECONDS") {
            Ok(raw) => match raw.parse::<u64>().map(Duration::from_secs) {
                Ok(v) if v >= MIN_SYNC_INTERVAL && v <= MAX_SYNC_INTERVAL => v,
                _ => {
                    warn!(
                        value = %raw,
                        default_seconds = defaults.interval.as_secs(),
                        "Invalid K6_SYNC_INTERVAL_SECONDS, using default"
                    );
                    defaults.interval
                }
            },
            Err(_) => defaults.interval,
        };

        let auto_start = std::env::var("K6_SYNC_AUTO_START")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(defaults.auto_start);

        let lock_ttl_factor = std::env::var("K6_SYNC_LOCK_TTL_FACTOR")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|f| f.is_finite())
            .unwrap_or(defaults.lock_ttl_factor)
            // A lease shorter than two intervals would expire between
            // ticks and invite spurious takeovers.
            .max(2.0);

        let stale_after = std::env::var("K6_SYNC_STALE_AFTER_SECONDS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.stale_after)
            // Anything checked within one interval is fresh by definition.
            .max(interval);

        let api_secret = std::env::var("SYNC_API_SECRET")
            .ok()
            .filter(|s| !s.is_empty());

        let log_tail_lines = std::env::var("K6_LOG_TAIL_LINES")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.log_tail_lines);

        Self {
            interval,
            auto_start,
            lock_ttl_factor,
            stale_after,
            api_secret,
            log_tail_lines,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("HACKLOAD_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("HACKLOAD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("HACKLOAD_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_env();
        let sync = SyncConfig::from_env();
        let kube = K6Config::from_env();

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            sync,
            kube,
        })
    }
}
