//! Driver configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/cba4.toml` (or a caller supplied path)
//! 2. Environment variables prefixed with `RUST_CBA_`, nested keys separated
//!    by a double underscore: `RUST_CBA_PROTOCOL__TIMEOUT_MS=500`
//!
//! Every field has a default, so an empty or missing file yields a working
//! configuration for the first attached instrument.
//!
//! # Example
//! ```no_run
//! use rust_cba::config::DriverConfig;
//!
//! let config = DriverConfig::load()?;
//! config.validate()?;
//! println!("timeout: {}ms", config.protocol.timeout_ms);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error_recovery::RetryPolicy;
use crate::protocol::{Checksum, FrameCodec};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/cba4.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RUST_CBA_";

/// Top-level driver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Which instrument to open
    #[serde(default)]
    pub device: DeviceConfig,
    /// Exchange timing and framing
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Watchdog keepalive worker
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Instrument selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial number printed on the unit. Takes precedence over `index`.
    #[serde(default)]
    pub serial_number: Option<u32>,
    /// Position among attached instruments, 0 for the first
    #[serde(default)]
    pub index: usize,
}

/// Exchange timing and framing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// How long to wait for each reply, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Resends after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before each resend, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Trailing frame checksum (none, sum8, xor8, crc16_modbus)
    #[serde(default)]
    pub checksum: Checksum,
}

/// Watchdog keepalive worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Poll the instrument in the background while a load is running
    #[serde(default = "default_keepalive_enabled")]
    pub enabled: bool,
    /// Poll interval in milliseconds
    #[serde(default = "default_keepalive_interval_ms")]
    pub interval_ms: u64,
}

/// Log output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    10
}

fn default_keepalive_enabled() -> bool {
    true
}

fn default_keepalive_interval_ms() -> u64 {
    333
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            checksum: Checksum::default(),
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: default_keepalive_enabled(),
            interval_ms: default_keepalive_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Upper bound on `protocol.max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Accepted range for `keepalive.interval_ms`.
pub const KEEPALIVE_INTERVAL_RANGE_MS: std::ops::RangeInclusive<u64> = 50..=1000;

impl DriverConfig {
    /// Load configuration from `config/cba4.toml` and environment variables
    ///
    /// Example override: `RUST_CBA_KEEPALIVE__ENABLED=false`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The provider stack behind [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        if self.protocol.timeout_ms == 0 {
            return Err("Invalid timeout_ms 0. Must be greater than zero".to_string());
        }

        if self.protocol.max_retries > MAX_RETRIES_LIMIT {
            return Err(format!(
                "Invalid max_retries {}. Must be 0-{}",
                self.protocol.max_retries, MAX_RETRIES_LIMIT
            ));
        }

        if self.keepalive.enabled && !KEEPALIVE_INTERVAL_RANGE_MS.contains(&self.keepalive.interval_ms) {
            return Err(format!(
                "Invalid keepalive interval_ms {}. Must be {}-{}",
                self.keepalive.interval_ms,
                KEEPALIVE_INTERVAL_RANGE_MS.start(),
                KEEPALIVE_INTERVAL_RANGE_MS.end()
            ));
        }

        Ok(())
    }

    /// Retry policy for the protocol engine
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.protocol.max_retries,
            timeout: Duration::from_millis(self.protocol.timeout_ms),
            backoff_delay: Duration::from_millis(self.protocol.retry_backoff_ms),
        }
    }

    /// Frame codec for the configured checksum
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.protocol.checksum)
    }

    /// Keepalive period, or `None` when the worker is disabled
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive
            .enabled
            .then(|| Duration::from_millis(self.keepalive.interval_ms))
    }
}
