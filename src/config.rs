use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::time::Duration;

use crate::error::ModbusError;

const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 3000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;
const DEFAULT_CONNECT_RETRY_ATTEMPTS: usize = 3;
const DEFAULT_CONNECT_RETRY_BACKOFF_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub response_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub connect_retry_attempts: usize,
    pub connect_retry_backoff_ms: u64,
    /// Hex-dump every frame sent and received at debug level.
    pub log_frames: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            connect_retry_attempts: DEFAULT_CONNECT_RETRY_ATTEMPTS,
            connect_retry_backoff_ms: DEFAULT_CONNECT_RETRY_BACKOFF_MS,
            log_frames: false,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            response_timeout_ms: env_or("MODBUS_RESPONSE_TIMEOUT_MS", DEFAULT_RESPONSE_TIMEOUT_MS),
            connect_timeout_ms: env_or("MODBUS_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
            connect_retry_attempts: env_or(
                "MODBUS_CONNECT_RETRY_ATTEMPTS",
                DEFAULT_CONNECT_RETRY_ATTEMPTS,
            ),
            connect_retry_backoff_ms: env_or(
                "MODBUS_CONNECT_RETRY_BACKOFF_MS",
                DEFAULT_CONNECT_RETRY_BACKOFF_MS,
            ),
            log_frames: std::env::var("MODBUS_LOG_FRAMES")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Parse a settings file. Keys are the lower-case env names without the
    /// `MODBUS_` prefix; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// `ModbusError::Config` carrying the line of the first TOML error.
    pub fn from_toml_str(s: &str) -> Result<Self, ModbusError> {
        toml::from_str(s).map_err(|e| {
            let line = e
                .span()
                .map_or(0, |span| s[..span.start.min(s.len())].lines().count().max(1));
            ModbusError::Config {
                line,
                message: e.message().to_string(),
            }
        })
    }

    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

/// Replace the environment-derived configuration. Only effective before the
/// first call to [`config`]; returns the rejected value otherwise.
///
/// # Errors
///
/// Returns `Err(config)` when the global was already initialized.
pub fn install(config: Config) -> Result<(), Config> {
    GLOBAL_CONFIG.set(config)
}

/// Global config, loaded from the environment at first access.
pub fn config() -> &'static Config {
    GLOBAL_CONFIG.get_or_init(Config::from_env)
}
