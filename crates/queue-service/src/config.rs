//! Queue service configuration.
//!
//! Loaded from environment variables. The redis URL may embed credentials and
//! is redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP/WebSocket bind address.
pub const DEFAULT_HTTP_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default number of attempts per persistence call.
pub const DEFAULT_PERSIST_MAX_ATTEMPTS: u32 = 3;

/// Default linear backoff step between persistence attempts.
pub const DEFAULT_PERSIST_RETRY_BACKOFF_MS: u64 = 50;

/// Default per-queue broadcast buffer.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Default cap on live queues per instance.
pub const DEFAULT_MAX_QUEUES: usize = 10_000;

/// Default graceful shutdown deadline.
pub const DEFAULT_SHUTDOWN_DEADLINE_SECONDS: u64 = 30;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "qs";

#[derive(Clone)]
pub struct Config {
    /// Redis URL; `None` selects the in-memory backend.
    pub redis_url: Option<SecretString>,

    /// HTTP bind address (default: "0.0.0.0:8080").
    pub http_bind_address: String,

    /// Unique identifier for this instance.
    pub instance_id: String,

    pub persist_max_attempts: u32,

    pub persist_retry_backoff: Duration,

    /// Events buffered per queue before a slow subscriber lags.
    pub broadcast_capacity: usize,

    pub max_queues: usize,

    pub shutdown_deadline: Duration,

    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("http_bind_address", &self.http_bind_address)
            .field("instance_id", &self.instance_id)
            .field("persist_max_attempts", &self.persist_max_attempts)
            .field("persist_retry_backoff", &self.persist_retry_backoff)
            .field("broadcast_capacity", &self.broadcast_capacity)
            .field("max_queues", &self.max_queues)
            .field("shutdown_deadline", &self.shutdown_deadline)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = vars
            .get("REDIS_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| SecretString::from(url.clone()));

        let http_bind_address = vars
            .get("QS_HTTP_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HTTP_BIND_ADDRESS.to_string());

        let persist_max_attempts: u32 =
            parse_or(vars, "QS_PERSIST_MAX_ATTEMPTS", DEFAULT_PERSIST_MAX_ATTEMPTS)?;
        if persist_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "QS_PERSIST_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let persist_retry_backoff = Duration::from_millis(parse_or(
            vars,
            "QS_PERSIST_RETRY_BACKOFF_MS",
            DEFAULT_PERSIST_RETRY_BACKOFF_MS,
        )?);

        let broadcast_capacity: usize =
            parse_or(vars, "QS_BROADCAST_CAPACITY", DEFAULT_BROADCAST_CAPACITY)?;
        if broadcast_capacity == 0 {
            // tokio's broadcast channel rejects a zero capacity
            return Err(ConfigError::InvalidValue(
                "QS_BROADCAST_CAPACITY must be at least 1".to_string(),
            ));
        }

        let max_queues = parse_or(vars, "QS_MAX_QUEUES", DEFAULT_MAX_QUEUES)?;

        let shutdown_deadline = Duration::from_secs(parse_or(
            vars,
            "QS_SHUTDOWN_DEADLINE_SECONDS",
            DEFAULT_SHUTDOWN_DEADLINE_SECONDS,
        )?);

        let log_json = parse_or(vars, "QS_LOG_JSON", false)?;

        let instance_id = vars.get("QS_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            redis_url,
            http_bind_address,
            instance_id,
            persist_max_attempts,
            persist_retry_backoff,
            broadcast_capacity,
            max_queues,
            shutdown_deadline,
            log_json,
        })
    }
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
    }
}
