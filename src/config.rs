//! Loads the knob set enumerated in §6 from the environment. Connection
//! details for individual tenant databases are not configured here,
//! those come from the control-plane store at runtime. Only the
//! control-plane connection itself and the supervisor/worker timings are.

use std::env;
use std::time::Duration;

use crate::errors::CoreError;
use crate::store::ConnectionParams;

const DEFAULT_CHECK_INTERVAL_SECS: u64 = 3;
const DEFAULT_FEEDBACK_INTERVAL_SECS: u64 = 10;
const DEFAULT_RECONNECT_BACKOFF_SECS: u64 = 20;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub control_store: ConnectionParams,
    /// Not named in §6's enumerated knob list, which only specs the
    /// control-plane's connection; an `ARCHIVE_STORE_*` block is added
    /// here by the same convention so the binary can run end-to-end
    /// against a real archive store rather than only the in-memory fake.
    pub archive_store: ConnectionParams,
    pub check_interval: Duration,
    pub feedback_interval: Duration,
    pub reconnect_backoff: Duration,
    pub read_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        let control_store = ConnectionParams {
            host: require_env("CONTROL_STORE_HOST")?,
            port: parse_env_or("CONTROL_STORE_PORT", 5432)?,
            database: require_env("CONTROL_STORE_DATABASE")?,
            user: require_env("CONTROL_STORE_USER")?,
            password: require_env("CONTROL_STORE_PASSWORD")?,
        };

        let archive_store = ConnectionParams {
            host: require_env("ARCHIVE_STORE_HOST")?,
            port: parse_env_or("ARCHIVE_STORE_PORT", 5432)?,
            database: require_env("ARCHIVE_STORE_DATABASE")?,
            user: require_env("ARCHIVE_STORE_USER")?,
            password: require_env("ARCHIVE_STORE_PASSWORD")?,
        };

        Ok(Self {
            control_store,
            archive_store,
            check_interval: Duration::from_secs(parse_env_or("CHECK_INTERVAL", DEFAULT_CHECK_INTERVAL_SECS)?),
            feedback_interval: Duration::from_secs(parse_env_or(
                "FEEDBACK_INTERVAL",
                DEFAULT_FEEDBACK_INTERVAL_SECS,
            )?),
            reconnect_backoff: Duration::from_secs(parse_env_or(
                "RECONNECT_BACKOFF",
                DEFAULT_RECONNECT_BACKOFF_SECS,
            )?),
            read_timeout: Duration::from_secs(parse_env_or("READ_TIMEOUT", DEFAULT_READ_TIMEOUT_SECS)?),
        })
    }
}

fn require_env(key: &str) -> Result<String, CoreError> {
    env::var(key).map_err(|_| CoreError::config(format!("missing required environment variable {key}")))
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, CoreError> {
    match env::var(key) {
        Ok(value) => value.parse().map_err(|_| CoreError::config(format!("invalid value for {key}"))),
        Err(_) => Ok(default),
    }
}
