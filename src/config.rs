//! Configuration resolution for the relay client.
//!
//! Tunable values use a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RELAY_CONNECT_TIMEOUT` | 30s | Relay connect and node handshake timeout in seconds |
//! | `RELAY_MAX_RETRIES` | 3 | Maximum relay connect retry attempts |
//! | `RELAY_RETRY_DELAY_MS` | 1000ms | Initial relay retry delay in milliseconds |
//! | `RELAY_COMPRESSION` | true | Enable zlib compression |
//! | `RELAY_SITES_TIMEOUT` | 10s | Deadline for the cluster listing in seconds |
//! | `RELAY_SESSION_REFRESH_MS` | 2000ms | How often the resize loop polls the session |

use std::env;
use std::time::Duration;

/// Default relay connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default maximum retry attempts for the relay connection
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default deadline for reading the cluster listing, in seconds
pub(crate) const DEFAULT_SITES_TIMEOUT_SECS: u64 = 10;

/// Default period of the remote session poll, in milliseconds
pub(crate) const DEFAULT_SESSION_REFRESH_MS: u64 = 2000;

/// Number of dial attempts per forwarded connection
pub const FORWARD_DIAL_ATTEMPTS: u32 = 5;

/// Backoff step between forward dial attempts (multiplied by the attempt number)
pub const FORWARD_BACKOFF_STEP: Duration = Duration::from_millis(100);

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "RELAY_CONNECT_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "RELAY_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "RELAY_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "RELAY_COMPRESSION";
pub(crate) const SITES_TIMEOUT_ENV_VAR: &str = "RELAY_SITES_TIMEOUT";
pub(crate) const SESSION_REFRESH_ENV_VAR: &str = "RELAY_SESSION_REFRESH_MS";

/// Parameter, then environment variable, then default.
fn resolve<T: std::str::FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.parse::<T>()
    {
        return value;
    }

    default
}

pub fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

pub fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    resolve(max_retries_param, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

pub fn resolve_retry_delay(retry_delay_param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        retry_delay_param,
        RETRY_DELAY_MS_ENV_VAR,
        DEFAULT_RETRY_DELAY_MS,
    ))
}

pub fn resolve_sites_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        SITES_TIMEOUT_ENV_VAR,
        DEFAULT_SITES_TIMEOUT_SECS,
    ))
}

pub fn resolve_session_refresh(period_param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        period_param,
        SESSION_REFRESH_ENV_VAR,
        DEFAULT_SESSION_REFRESH_MS,
    ))
}

/// Compression accepts `true`/`1` (any case) as enabled; anything else disables it.
pub fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// Timeouts and retry settings, resolved once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compress: bool,
    pub sites_timeout: Duration,
    pub session_refresh: Duration,
}

impl Settings {
    /// Resolve every value from the environment or defaults.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: resolve_connect_timeout(None),
            max_retries: resolve_max_retries(None),
            retry_delay: resolve_retry_delay(None),
            compress: resolve_compression(None),
            sites_timeout: resolve_sites_timeout(None),
            session_refresh: resolve_session_refresh(None),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            compress: true,
            sites_timeout: Duration::from_secs(DEFAULT_SITES_TIMEOUT_SECS),
            session_refresh: Duration::from_millis(DEFAULT_SESSION_REFRESH_MS),
        }
    }
}
